//! Batch inference provider abstraction and its HTTP implementation.
//!
//! The engine only sees the [`BatchProvider`] trait: submit a chunk payload,
//! poll the resulting job, fetch the newline-delimited output artifact.
//! [`HttpBatchProvider`] speaks an OpenAI-style batch API over `reqwest`.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use fieldsmith_shared::{FieldsmithError, ProviderConfig, Result};

use crate::payload::ChunkPayload;

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Fieldsmith/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Job handle and status
// ---------------------------------------------------------------------------

/// Provider-assigned handle for one submitted batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// Coarse job state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

/// Snapshot of one poll cycle.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// File handle for the completed-results artifact, once available.
    pub output_file_id: Option<String>,
    /// File handle for per-request error lines, if any.
    pub error_file_id: Option<String>,
    /// Provider-supplied detail for failed/cancelled jobs.
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// BatchProvider trait
// ---------------------------------------------------------------------------

/// Asynchronous batch inference endpoint.
///
/// Implementations must be side-effect free on failure: a submit that errors
/// must not leave a job running provider-side under a handle the caller
/// never sees.
pub trait BatchProvider {
    /// Submit one chunk payload, returning the provider's job handle.
    fn submit(&self, payload: &ChunkPayload) -> impl Future<Output = Result<JobHandle>> + Send;

    /// Poll the current status of a submitted job.
    fn poll(&self, job: &JobHandle) -> impl Future<Output = Result<JobStatus>> + Send;

    /// Fetch a newline-delimited output artifact by file handle.
    fn fetch(&self, file_id: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// OpenAI-style batch API client: upload JSONL, create batch, poll, download.
pub struct HttpBatchProvider {
    client: Client,
    base_url: Url,
    api_key: String,
    completion_window: String,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

impl HttpBatchProvider {
    /// Build a client from provider config and a resolved API key.
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            FieldsmithError::config(format!("invalid provider base_url {}: {e}", config.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| FieldsmithError::Provider(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            completion_window: config.completion_window.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FieldsmithError::Provider(format!("bad endpoint {path}: {e}")))
    }

    /// Map an HTTP response status to our error taxonomy. Throttling and
    /// server-side errors are transient; other client errors are not.
    fn status_error(status: StatusCode, context: &str, body: &str) -> FieldsmithError {
        let excerpt: String = body.chars().take(300).collect();
        let detail = format!("{context}: HTTP {status} {excerpt}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            FieldsmithError::Provider(detail)
        } else {
            FieldsmithError::validation(detail)
        }
    }

    async fn read_body(response: reqwest::Response, context: &str) -> Result<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FieldsmithError::Provider(format!("{context}: {e}")))?;
        if !status.is_success() {
            return Err(Self::status_error(status, context, &body));
        }
        Ok(body)
    }

    /// Upload the JSONL payload, returning the input file handle.
    async fn upload_payload(&self, payload: &ChunkPayload) -> Result<String> {
        let jsonl = payload.to_jsonl()?;
        let url = self.endpoint("/v1/files?purpose=batch")?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/jsonl")
            .body(jsonl)
            .send()
            .await
            .map_err(|e| FieldsmithError::Provider(format!("file upload: {e}")))?;

        let body = Self::read_body(response, "file upload").await?;
        let file: FileObject = serde_json::from_str(&body)
            .map_err(|e| FieldsmithError::Provider(format!("file upload response: {e}")))?;

        debug!(file_id = %file.id, requests = payload.request_count(), "payload uploaded");
        Ok(file.id)
    }
}

impl BatchProvider for HttpBatchProvider {
    async fn submit(&self, payload: &ChunkPayload) -> Result<JobHandle> {
        let input_file_id = self.upload_payload(payload).await?;

        let url = self.endpoint("/v1/batches")?;
        let request = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/responses",
            "completion_window": self.completion_window,
            "metadata": { "task": "product_field_enrichment" },
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FieldsmithError::Provider(format!("batch create: {e}")))?;

        let body = Self::read_body(response, "batch create").await?;
        let batch: BatchObject = serde_json::from_str(&body)
            .map_err(|e| FieldsmithError::Provider(format!("batch create response: {e}")))?;

        info!(batch_id = %batch.id, status = %batch.status, chunk = payload.chunk_index, "batch submitted");
        Ok(JobHandle { id: batch.id })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus> {
        let url = self.endpoint(&format!("/v1/batches/{}", job.id))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| FieldsmithError::Provider(format!("batch poll {}: {e}", job.id)))?;

        let body = Self::read_body(response, "batch poll").await?;
        let batch: BatchObject = serde_json::from_str(&body)
            .map_err(|e| FieldsmithError::Poll(format!("batch poll response: {e}")))?;

        let state = match batch.status.as_str() {
            "validating" | "in_progress" | "finalizing" => JobState::InProgress,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "expired" => JobState::Expired,
            "cancelled" | "cancelling" => JobState::Cancelled,
            other => {
                return Err(FieldsmithError::Poll(format!(
                    "{}: unknown batch status {other:?}",
                    job.id
                )));
            }
        };

        let message = batch.errors.as_ref().map(|e| e.to_string());

        debug!(batch_id = %batch.id, status = %batch.status, "batch polled");
        Ok(JobStatus {
            state,
            output_file_id: batch.output_file_id,
            error_file_id: batch.error_file_id,
            message,
        })
    }

    async fn fetch(&self, file_id: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&format!("/v1/files/{file_id}/content"))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| FieldsmithError::Provider(format!("file fetch {file_id}: {e}")))?;

        let body = Self::read_body(response, "file fetch").await?;
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}
