//! Run orchestration: records → fragments → chunks → sequential batch jobs.
//!
//! Chunks are dispatched strictly one at a time so every chunk's payload can
//! inherit the context digest of its predecessors. A chunk failure never
//! aborts the run retroactively: completed chunks keep their results, the
//! failed chunk is reported, and the remainder is skipped. Cancellation is
//! honored between chunks only, so an in-flight batch job always reaches a
//! terminal state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use fieldsmith_shared::{
    BatchState, BudgetConfig, Chunk, ChunkReport, ChunkStatus, ContextConfig, Fragment, Record,
    RecordId, Result, RunId, RunReport, ValidationStatus, CURRENT_SCHEMA_VERSION,
};
use fieldsmith_provider::{BatchProvider, LifecycleDriver};

use crate::budget::{BudgetScope, BudgetTracker};
use crate::context::ContextCarrier;
use crate::payload::PayloadBuilder;
use crate::persist::{ChunkCheckpoint, RunCheckpoint, RunPlan, RunStore};
use crate::reconciler::{reconcile, ReconcileOutcome};
use crate::segmenter::{segment, SegmentOutcome};

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Notable events during a run, for progress reporting and audit trails.
#[derive(Debug)]
pub enum RunEvent {
    RecordRejected { id: RecordId, reason: String },
    ChunkDispatched { index: usize, records: usize, weight: u64 },
    ChunkCompleted { index: usize, valid: usize, qa_flagged: usize },
    ChunkFailed { index: usize, reason: String },
    ChunkSkipped { index: usize, reason: String },
    RunFinished { complete: bool },
}

/// Receives run events as they happen. Implementations must not block.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Default observer that discards everything.
pub struct NullObserver;

impl RunObserver for NullObserver {
    fn on_event(&self, _event: &RunEvent) {}
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Explicit run state, advanced only by [`Sequencer::run`].
///
/// `Dispatch(i)` cannot begin until `AwaitingContext(i - 1)` has resolved,
/// which is what serializes chunk submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Segmenting,
    Chunking,
    /// Chunk `i` is being built and driven to a terminal job state.
    Dispatch(usize),
    /// Chunk `i` finished; its digest is being extracted for chunk `i + 1`.
    AwaitingContext(usize),
    /// Every chunk completed.
    Done,
    /// At least one chunk failed or was skipped; completed results preserved.
    PartialFailure,
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Greedily pack fragments into chunks under the ceiling.
///
/// Chunk boundaries never split a fragment; a fragment heavier than the
/// ceiling gets a chunk of its own.
pub fn chunk_fragments(fragments: Vec<Fragment>, ceiling: u64) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<Fragment> = Vec::new();
    let mut weight = 0u64;

    for fragment in fragments {
        if !current.is_empty() && weight + fragment.weight > ceiling {
            chunks.push(Chunk {
                index: chunks.len(),
                fragments: std::mem::take(&mut current),
            });
            weight = 0;
        }
        weight += fragment.weight;
        current.push(fragment);
    }
    if !current.is_empty() {
        chunks.push(Chunk {
            index: chunks.len(),
            fragments: current,
        });
    }
    chunks
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// Owns one run end to end: segmentation, chunking, sequential dispatch,
/// reconciliation, and context carrying.
pub struct Sequencer<P> {
    driver: LifecycleDriver<P>,
    builder: PayloadBuilder,
    budget_config: BudgetConfig,
    budget: BudgetTracker,
    carrier: ContextCarrier,
    store: RunStore,
    observer: Box<dyn RunObserver>,
    cancel: Arc<AtomicBool>,
    state: SequencerState,
}

impl<P: BatchProvider> Sequencer<P> {
    pub fn new(
        driver: LifecycleDriver<P>,
        builder: PayloadBuilder,
        budget: BudgetConfig,
        context: &ContextConfig,
        store: RunStore,
    ) -> Self {
        let carrier = ContextCarrier::new(context.policy, context.last_k, budget.digest_budget);
        Self {
            driver,
            builder,
            budget: BudgetTracker::new(budget.clone()),
            budget_config: budget,
            carrier,
            store,
            observer: Box::new(NullObserver),
            cancel: Arc::new(AtomicBool::new(false)),
            state: SequencerState::Idle,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shared flag that stops the run before the next chunk when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    fn transition(&mut self, next: SequencerState) {
        tracing::debug!(from = ?self.state, to = ?next, "sequencer transition");
        self.state = next;
    }

    /// Execute a full run over the ingested records.
    ///
    /// Returns the run report; partial success is a normal return, not an
    /// error. `Err` is reserved for conditions that prevent the run from
    /// proceeding at all (artifact I/O, plan serialization).
    #[instrument(skip_all, fields(run_id = %self.store.run_id(), records = records.len()))]
    pub async fn run(&mut self, records: &[Record]) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = self.store.run_id().clone();

        self.transition(SequencerState::Segmenting);
        let SegmentOutcome {
            fragments,
            rejected,
        } = segment(records, |r| r.group_key.as_str(), &self.budget_config);
        for rejection in &rejected {
            self.observer.on_event(&RunEvent::RecordRejected {
                id: rejection.id.clone(),
                reason: rejection.reason.clone(),
            });
        }

        self.transition(SequencerState::Chunking);
        let chunks = chunk_fragments(fragments, self.budget_config.per_batch_ceiling);
        info!(chunks = chunks.len(), rejected = rejected.len(), "run planned");

        self.store.write_plan(&RunPlan {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: run_id.clone(),
            chunks: chunks.clone(),
            rejected: rejected.clone(),
            schema: self.builder.schema().clone(),
        })?;

        let mut checkpoint = RunCheckpoint::new(run_id.clone());
        let mut chunk_reports: Vec<ChunkReport> = Vec::new();
        let mut results = Vec::new();
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut skip_reason: Option<String> = None;

        for chunk in &chunks {
            if skip_reason.is_none() && self.cancel.load(Ordering::Relaxed) {
                skip_reason = Some("run cancelled".into());
            }
            if skip_reason.is_none()
                && !self
                    .budget
                    .fits(chunk.weight(), BudgetScope::RollingWindow, Utc::now())
            {
                skip_reason = Some(format!(
                    "window budget exhausted before chunk {}",
                    chunk.index
                ));
            }
            if let Some(reason) = skip_reason.clone() {
                warn!(chunk = chunk.index, reason = %reason, "chunk skipped");
                self.observer.on_event(&RunEvent::ChunkSkipped {
                    index: chunk.index,
                    reason: reason.clone(),
                });
                chunk_reports.push(empty_report(chunk, ChunkStatus::Skipped { reason }));
                continue;
            }

            self.transition(SequencerState::Dispatch(chunk.index));
            let digest = self.carrier.effective();
            let payload = self.builder.build_chunk(chunk, digest.as_ref());
            self.store.write_payload(&payload)?;
            self.observer.on_event(&RunEvent::ChunkDispatched {
                index: chunk.index,
                records: chunk.record_count(),
                weight: chunk.weight(),
            });

            let drive = self.driver.drive(&payload).await;

            // The provider confirmed the submission, so the tokens count
            // against the rolling window even if the job later failed.
            if let Some(submitted_at) = drive.job.submitted_at {
                self.budget.commit(chunk.weight(), submitted_at);
            }

            match drive.raw_lines {
                Some(lines) => {
                    self.transition(SequencerState::AwaitingContext(chunk.index));
                    let sha = self.store.write_raw_output(chunk.index, &lines)?;
                    let outcome = reconcile(chunk, &lines, self.builder.schema());
                    self.carrier.digest(chunk.index, &outcome.results);

                    tokens_in += outcome.tokens_in;
                    tokens_out += outcome.tokens_out;
                    self.observer.on_event(&RunEvent::ChunkCompleted {
                        index: chunk.index,
                        valid: outcome.count_status(ValidationStatus::Valid),
                        qa_flagged: outcome.count_status(ValidationStatus::QaFlagged),
                    });
                    chunk_reports.push(completed_report(chunk, &outcome));
                    results.extend(outcome.results);

                    checkpoint.chunks.push(ChunkCheckpoint {
                        job: drive.job,
                        output_sha256: Some(sha),
                        failure: None,
                    });
                }
                None => {
                    let reason = drive
                        .failure
                        .unwrap_or_else(|| "batch job failed".to_string());
                    warn!(chunk = chunk.index, reason = %reason, "chunk failed");
                    self.observer.on_event(&RunEvent::ChunkFailed {
                        index: chunk.index,
                        reason: reason.clone(),
                    });
                    chunk_reports.push(empty_report(
                        chunk,
                        ChunkStatus::Failed {
                            reason: reason.clone(),
                        },
                    ));
                    checkpoint.chunks.push(ChunkCheckpoint {
                        job: drive.job,
                        output_sha256: None,
                        failure: Some(reason),
                    });
                    skip_reason = Some(format!("predecessor chunk {} failed", chunk.index));
                }
            }

            checkpoint.updated_at = Utc::now();
            self.store.write_checkpoint(&checkpoint)?;
        }

        let report = RunReport {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
            chunks: chunk_reports,
            rejected,
            tokens_in,
            tokens_out,
        };
        self.transition(if report.is_complete() {
            SequencerState::Done
        } else {
            SequencerState::PartialFailure
        });
        self.store.write_report(&report)?;
        self.observer.on_event(&RunEvent::RunFinished {
            complete: report.is_complete(),
        });
        info!(
            complete = report.is_complete(),
            results = report.results.len(),
            tokens_in,
            tokens_out,
            "run finished"
        );
        Ok(report)
    }
}

fn completed_report(chunk: &Chunk, outcome: &ReconcileOutcome) -> ChunkReport {
    ChunkReport {
        index: chunk.index,
        status: ChunkStatus::Completed,
        records_total: chunk.record_count(),
        valid: outcome.count_status(ValidationStatus::Valid),
        qa_flagged: outcome.count_status(ValidationStatus::QaFlagged),
        schema_errors: outcome.count_status(ValidationStatus::SchemaError),
        missing_output: outcome.count_status(ValidationStatus::MissingOutput),
        tokens_in: outcome.tokens_in,
        tokens_out: outcome.tokens_out,
    }
}

fn empty_report(chunk: &Chunk, status: ChunkStatus) -> ChunkReport {
    ChunkReport {
        index: chunk.index,
        status,
        records_total: chunk.record_count(),
        valid: 0,
        qa_flagged: 0,
        schema_errors: 0,
        missing_output: 0,
        tokens_in: 0,
        tokens_out: 0,
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Rebuild a run report from persisted artifacts, without any provider
/// traffic.
///
/// Completed chunks are re-reconciled from their raw output artifacts, which
/// is deterministic, so a replayed report carries the same results as the
/// original. Timestamps reflect the replay, not the original run.
pub fn replay_run(store: &RunStore) -> Result<RunReport> {
    let plan = store.read_plan()?;
    let checkpoint = store.read_checkpoint()?;

    let mut chunk_reports = Vec::new();
    let mut results = Vec::new();
    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;

    for chunk in &plan.chunks {
        let entry = checkpoint
            .chunks
            .iter()
            .find(|c| c.job.chunk_index == chunk.index);
        match entry {
            Some(entry) if entry.job.state == BatchState::Completed => {
                if let Some(sha) = &entry.output_sha256 {
                    store.verify_output(chunk.index, sha)?;
                }
                let lines = store.read_raw_output(chunk.index)?;
                let outcome = reconcile(chunk, &lines, &plan.schema);
                tokens_in += outcome.tokens_in;
                tokens_out += outcome.tokens_out;
                chunk_reports.push(completed_report(chunk, &outcome));
                results.extend(outcome.results);
            }
            Some(entry) => {
                let reason = entry
                    .failure
                    .clone()
                    .unwrap_or_else(|| format!("job ended in state {:?}", entry.job.state));
                chunk_reports.push(empty_report(chunk, ChunkStatus::Failed { reason }));
            }
            None => {
                chunk_reports.push(empty_report(
                    chunk,
                    ChunkStatus::Skipped {
                        reason: "not attempted in the original run".into(),
                    },
                ));
            }
        }
    }

    info!(run_id = %plan.run_id, chunks = chunk_reports.len(), "run replayed from artifacts");

    Ok(RunReport {
        schema_version: CURRENT_SCHEMA_VERSION,
        run_id: plan.run_id,
        started_at: checkpoint.updated_at,
        finished_at: Utc::now(),
        results,
        chunks: chunk_reports,
        rejected: plan.rejected,
        tokens_in,
        tokens_out,
    })
}

/// Open a run's artifacts and rebuild its report.
pub fn replay(root: &std::path::Path, run_id: RunId) -> Result<RunReport> {
    let store = RunStore::open(root, run_id)?;
    replay_run(&store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use fieldsmith_shared::{FieldsmithError, OutputSchema, PollingConfig};
    use fieldsmith_provider::{ChunkPayload, JobHandle, JobState, JobStatus};

    // -----------------------------------------------------------------------
    // Echo provider double
    // -----------------------------------------------------------------------

    fn echo_line(custom_id: &str) -> String {
        let fields = serde_json::json!({
            "title": { "value": format!("Refined {custom_id}"), "confidence": "high" },
        });
        serde_json::json!({
            "custom_id": custom_id,
            "response": {
                "body": {
                    "output": [{ "content": [{ "type": "output_text", "text": fields.to_string() }] }],
                    "usage": { "input_tokens": 50, "output_tokens": 20 },
                },
            },
            "error": null,
        })
        .to_string()
    }

    /// Completes every submitted chunk immediately, echoing one output line
    /// per request. Shared state so tests can inspect submitted payloads.
    #[derive(Clone, Default)]
    struct EchoProvider {
        files: Arc<Mutex<HashMap<String, Vec<String>>>>,
        payloads: Arc<Mutex<Vec<ChunkPayload>>>,
        fail_chunk: Option<usize>,
    }

    impl EchoProvider {
        fn failing_on(chunk_index: usize) -> Self {
            Self {
                fail_chunk: Some(chunk_index),
                ..Default::default()
            }
        }

        fn payload_text(&self, chunk: usize, request: usize) -> String {
            let payloads = self.payloads.lock().unwrap();
            let payload = payloads.iter().find(|p| p.chunk_index == chunk).unwrap();
            payload.requests[request].body["input"][0]["content"][0]["text"]
                .as_str()
                .unwrap()
                .to_string()
        }
    }

    impl BatchProvider for EchoProvider {
        async fn submit(&self, payload: &ChunkPayload) -> fieldsmith_shared::Result<JobHandle> {
            if self.fail_chunk == Some(payload.chunk_index) {
                return Err(FieldsmithError::validation("rejected by provider"));
            }
            let lines = payload
                .requests
                .iter()
                .map(|r| echo_line(&r.custom_id))
                .collect();
            self.files
                .lock()
                .unwrap()
                .insert(format!("file_{}", payload.chunk_index), lines);
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(JobHandle {
                id: format!("batch_{}", payload.chunk_index),
            })
        }

        async fn poll(&self, job: &JobHandle) -> fieldsmith_shared::Result<JobStatus> {
            let index = job.id.trim_start_matches("batch_");
            Ok(JobStatus {
                state: JobState::Completed,
                output_file_id: Some(format!("file_{index}")),
                error_file_id: None,
                message: None,
            })
        }

        async fn fetch(&self, file_id: &str) -> fieldsmith_shared::Result<Vec<String>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(file_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn budget_config(per_request: u64, per_batch: u64, window: u64) -> BudgetConfig {
        BudgetConfig {
            per_request_ceiling: per_request,
            per_batch_ceiling: per_batch,
            window_ceiling: window,
            window: Duration::from_secs(3600),
            digest_budget: 500,
        }
    }

    fn fast_polling() -> PollingConfig {
        PollingConfig {
            initial_interval_ms: 1,
            max_interval_ms: 4,
            max_attempts: 3,
            max_job_age_secs: 3600,
        }
    }

    fn record(i: usize, weight: u64) -> Record {
        Record {
            id: fieldsmith_shared::RecordId::new(format!("sku-{i}")),
            group_key: format!("g{i}"),
            fields: BTreeMap::from([("title".into(), format!("raw item {i}"))]),
            image_urls: vec![],
            weight,
        }
    }

    fn records(n: usize, weight: u64) -> Vec<Record> {
        (0..n).map(|i| record(i, weight)).collect()
    }

    fn fragment(index: usize, weight: u64) -> Fragment {
        Fragment {
            index,
            records: vec![record(index, weight)],
            weight,
            context_incomplete: false,
        }
    }

    fn sequencer(
        provider: EchoProvider,
        budget: BudgetConfig,
        store: RunStore,
    ) -> Sequencer<EchoProvider> {
        let driver = LifecycleDriver::new(provider, fast_polling());
        let builder = PayloadBuilder::new(
            "test-model",
            "Act as a product data analyst.",
            OutputSchema::permissive("fields_extracted_response"),
        );
        Sequencer::new(driver, builder, budget, &ContextConfig::default(), store)
    }

    fn store() -> (tempfile::TempDir, RunStore) {
        let root = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(root.path(), RunId::new()).expect("store");
        (root, store)
    }

    // -----------------------------------------------------------------------
    // Chunking
    // -----------------------------------------------------------------------

    #[test]
    fn chunking_packs_without_splitting_fragments() {
        let fragments = vec![fragment(0, 40), fragment(1, 40), fragment(2, 40)];
        let chunks = chunk_fragments(fragments, 100);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].fragments.len(), 2);
        assert_eq!(chunks[1].fragments.len(), 1);
        assert_eq!(chunks[0].weight(), 80);
    }

    #[test]
    fn oversized_fragment_gets_its_own_chunk() {
        let fragments = vec![fragment(0, 10), fragment(1, 500), fragment(2, 10)];
        let chunks = chunk_fragments(fragments, 100);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].weight(), 500);
        assert_eq!(chunks[1].fragments.len(), 1);
    }

    #[test]
    fn chunking_empty_input() {
        assert!(chunk_fragments(vec![], 100).is_empty());
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn run_completes_all_chunks() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        let store_handle = store.clone();
        let mut seq = sequencer(provider, budget_config(60, 1000, 1000), store);

        // 4 records of weight 30, distinct groups: 2 fragments, 1 chunk.
        assert_eq!(seq.state(), SequencerState::Idle);
        let report = seq.run(&records(4, 30)).await.expect("run");

        assert!(report.is_complete());
        assert_eq!(seq.state(), SequencerState::Done);
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.count_status(ValidationStatus::Valid), 4);
        assert_eq!(report.tokens_in, 200);
        assert_eq!(report.tokens_out, 80);

        // Artifacts are on disk.
        let persisted = store_handle.read_report().expect("report artifact");
        assert_eq!(persisted.results.len(), 4);
        assert!(store_handle.read_plan().is_ok());
        assert_eq!(store_handle.read_checkpoint().unwrap().chunks.len(), 1);
    }

    #[tokio::test]
    async fn later_chunks_inherit_context() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        // Per-batch ceiling of 30 forces one record per chunk: 2 chunks.
        let mut seq = sequencer(provider.clone(), budget_config(30, 30, 1000), store);

        let report = seq.run(&records(2, 30)).await.expect("run");
        assert!(report.is_complete());

        let first = provider.payload_text(0, 0);
        assert!(!first.contains("# Prior Batch Context"));

        let second = provider.payload_text(1, 0);
        assert!(second.contains("# Prior Batch Context"));
        assert!(second.contains("Refined sku-0"));
    }

    #[tokio::test]
    async fn failed_chunk_isolates_successors() {
        let provider = EchoProvider::failing_on(1);
        let (_root, store) = store();
        let mut seq = sequencer(provider, budget_config(30, 30, 1000), store);

        let report = seq.run(&records(3, 30)).await.expect("run");
        assert!(!report.is_complete());
        assert_eq!(seq.state(), SequencerState::PartialFailure);

        assert_eq!(report.chunks.len(), 3);
        assert_eq!(report.chunks[0].status, ChunkStatus::Completed);
        assert!(matches!(report.chunks[1].status, ChunkStatus::Failed { .. }));
        match &report.chunks[2].status {
            ChunkStatus::Skipped { reason } => {
                assert!(reason.contains("predecessor chunk 1 failed"));
            }
            other => panic!("expected skipped, got {other:?}"),
        }

        // Results from the completed chunk survive.
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].id.as_str(), "sku-0");
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_chunks() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        let mut seq = sequencer(provider, budget_config(30, 30, 1000), store);

        seq.cancel_flag().store(true, Ordering::Relaxed);
        let report = seq.run(&records(2, 30)).await.expect("run");

        assert!(report.results.is_empty());
        for chunk in &report.chunks {
            match &chunk.status {
                ChunkStatus::Skipped { reason } => assert_eq!(reason, "run cancelled"),
                other => panic!("expected skipped, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn window_exhaustion_skips_later_chunks() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        // Two 60-token chunks against a 100-token window: only one fits.
        let mut seq = sequencer(provider, budget_config(60, 60, 100), store);

        let report = seq.run(&records(4, 30)).await.expect("run");

        assert_eq!(report.chunks.len(), 2);
        assert_eq!(report.chunks[0].status, ChunkStatus::Completed);
        match &report.chunks[1].status {
            ChunkStatus::Skipped { reason } => {
                assert!(reason.contains("window budget exhausted"));
            }
            other => panic!("expected skipped, got {other:?}"),
        }
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn rejected_records_appear_in_report() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        let mut seq = sequencer(provider, budget_config(60, 1000, 1000), store);

        let mut input = records(2, 30);
        input.push(record(99, 5000)); // beyond the window ceiling
        let report = seq.run(&input).await.expect("run");

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].id.as_str(), "sku-99");
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn replay_rebuilds_identical_results() {
        let provider = EchoProvider::default();
        let (_root, store) = store();
        let store_handle = store.clone();
        let mut seq = sequencer(provider, budget_config(30, 30, 1000), store);

        let original = seq.run(&records(2, 30)).await.expect("run");
        let replayed = replay_run(&store_handle).expect("replay");

        assert_eq!(replayed.results, original.results);
        assert_eq!(replayed.chunks.len(), original.chunks.len());
        assert_eq!(replayed.tokens_in, original.tokens_in);
        assert!(replayed.is_complete());
    }

    #[tokio::test]
    async fn replay_preserves_failure_shape() {
        let provider = EchoProvider::failing_on(1);
        let (_root, store) = store();
        let store_handle = store.clone();
        let mut seq = sequencer(provider, budget_config(30, 30, 1000), store);

        seq.run(&records(3, 30)).await.expect("run");
        let replayed = replay_run(&store_handle).expect("replay");

        assert_eq!(replayed.chunks[0].status, ChunkStatus::Completed);
        assert!(matches!(replayed.chunks[1].status, ChunkStatus::Failed { .. }));
        assert!(matches!(replayed.chunks[2].status, ChunkStatus::Skipped { .. }));
        assert_eq!(replayed.results.len(), 1);
    }
}
