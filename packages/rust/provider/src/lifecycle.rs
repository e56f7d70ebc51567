//! Batch lifecycle driver: submit → poll → fetch with retry semantics.
//!
//! The driver owns all waiting. Backoff is computed by a pure function and
//! the only sleep is at the driver's edge, so the policy stays testable and
//! the provider swappable.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use fieldsmith_shared::{BatchJob, BatchState, FieldsmithError, PollingConfig, Result};

use crate::client::{BatchProvider, JobHandle, JobState};
use crate::payload::ChunkPayload;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Bounded exponential backoff: `initial * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    initial.saturating_mul(factor).min(max)
}

// ---------------------------------------------------------------------------
// Drive result
// ---------------------------------------------------------------------------

/// Terminal outcome of driving one chunk's batch job.
///
/// The job always carries a terminal state. `raw_lines` is present only for
/// completed jobs; `failure` explains failed/expired ones. The caller can
/// tell from [`BatchJob::was_submitted`] whether token budget was consumed.
#[derive(Debug)]
pub struct DriveResult {
    pub job: BatchJob,
    pub raw_lines: Option<Vec<String>>,
    pub failure: Option<String>,
}

impl DriveResult {
    fn failed(job: BatchJob, reason: String) -> Self {
        Self {
            job,
            raw_lines: None,
            failure: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleDriver
// ---------------------------------------------------------------------------

/// Drives one batch job at a time through its full lifecycle.
pub struct LifecycleDriver<P> {
    provider: P,
    config: PollingConfig,
}

impl<P: BatchProvider> LifecycleDriver<P> {
    pub fn new(provider: P, config: PollingConfig) -> Self {
        Self { provider, config }
    }

    /// Drive a chunk payload to a terminal state.
    ///
    /// Submission and polling retry transient failures up to the configured
    /// attempt limit. A job still running past `max_job_age` is expired
    /// rather than waited on forever.
    #[instrument(skip_all, fields(chunk = payload.chunk_index, requests = payload.request_count()))]
    pub async fn drive(&self, payload: &ChunkPayload) -> DriveResult {
        let mut job = BatchJob::built(payload.chunk_index);

        // --- Submit, with retries on transient failures ---
        let handle = match self.submit_with_retries(payload, &mut job).await {
            Ok(handle) => handle,
            Err(e) => {
                job.state = BatchState::Failed;
                return DriveResult::failed(job, FieldsmithError::Submission(e.to_string()).to_string());
            }
        };

        job.provider_job_id = Some(handle.id.clone());
        job.submitted_at = Some(Utc::now());
        job.state = BatchState::Submitted;

        // --- Poll until terminal ---
        self.poll_to_completion(&handle, job).await
    }

    async fn submit_with_retries(
        &self,
        payload: &ChunkPayload,
        job: &mut BatchJob,
    ) -> Result<JobHandle> {
        let mut attempt = 0u32;
        loop {
            match self.provider.submit(payload).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.initial_interval(),
                        self.config.max_interval(),
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient submission failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    job.retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_to_completion(&self, handle: &JobHandle, mut job: BatchJob) -> DriveResult {
        job.state = BatchState::Polling;
        let mut poll_round = 0u32;
        let mut poll_failures = 0u32;

        loop {
            // Expire jobs the provider keeps reporting as running.
            if let Some(submitted_at) = job.submitted_at {
                let age = (Utc::now() - submitted_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age > self.config.max_job_age() {
                    job.state = BatchState::Expired;
                    warn!(job_id = %handle.id, age_secs = age.as_secs(), "job exceeded maximum age");
                    return DriveResult::failed(
                        job,
                        FieldsmithError::JobExpired(handle.id.clone()).to_string(),
                    );
                }
            }

            let status = match self.provider.poll(handle).await {
                Ok(status) => {
                    poll_failures = 0;
                    status
                }
                Err(e) if e.is_transient() && poll_failures + 1 < self.config.max_attempts => {
                    poll_failures += 1;
                    job.retry_count += 1;
                    warn!(job_id = %handle.id, error = %e, "transient poll failure, backing off");
                    let delay = backoff_delay(
                        poll_failures,
                        self.config.initial_interval(),
                        self.config.max_interval(),
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    job.state = BatchState::Failed;
                    return DriveResult::failed(job, e.to_string());
                }
            };

            match status.state {
                JobState::InProgress => {
                    let delay = backoff_delay(
                        poll_round,
                        self.config.initial_interval(),
                        self.config.max_interval(),
                    );
                    poll_round += 1;
                    tokio::time::sleep(delay).await;
                }
                JobState::Completed => {
                    return self.collect_outputs(handle, job, status).await;
                }
                JobState::Expired => {
                    job.state = BatchState::Expired;
                    return DriveResult::failed(
                        job,
                        FieldsmithError::JobExpired(handle.id.clone()).to_string(),
                    );
                }
                JobState::Failed | JobState::Cancelled => {
                    job.state = BatchState::Failed;
                    let reason = status
                        .message
                        .unwrap_or_else(|| format!("provider reported {:?}", status.state));
                    return DriveResult::failed(job, reason);
                }
            }
        }
    }

    /// Download completed results. Per-request error lines, when present,
    /// are appended so the reconciler sees every custom_id the provider
    /// acknowledged.
    async fn collect_outputs(
        &self,
        handle: &JobHandle,
        mut job: BatchJob,
        status: crate::client::JobStatus,
    ) -> DriveResult {
        let Some(output_file_id) = status.output_file_id else {
            job.state = BatchState::Failed;
            return DriveResult::failed(
                job,
                format!("job {} completed with no output file", handle.id),
            );
        };

        let mut lines = match self.provider.fetch(&output_file_id).await {
            Ok(lines) => lines,
            Err(e) => {
                job.state = BatchState::Failed;
                return DriveResult::failed(job, format!("output fetch failed: {e}"));
            }
        };

        if let Some(error_file_id) = status.error_file_id {
            match self.provider.fetch(&error_file_id).await {
                Ok(error_lines) => {
                    warn!(job_id = %handle.id, errors = error_lines.len(), "job completed with partial errors");
                    lines.extend(error_lines);
                }
                Err(e) => {
                    warn!(job_id = %handle.id, error = %e, "error file fetch failed, proceeding with outputs only");
                }
            }
        }

        job.state = BatchState::Completed;
        info!(job_id = %handle.id, lines = lines.len(), "batch job completed");
        DriveResult {
            job,
            raw_lines: Some(lines),
            failure: None,
        }
    }
}
