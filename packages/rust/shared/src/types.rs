//! Core domain types for the Fieldsmith batch sequencing engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for persisted run artifacts.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Stable identifier for one product/SKU record.
///
/// Opaque to the engine; the ingestion collaborator supplies it (e.g. a
/// catalog GID or a SKU string) and the reconciler matches outputs on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One product/SKU worth of raw, field-mapped input data.
///
/// Immutable once ingested. `weight` is the estimated token cost of
/// submitting this record, computed at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Grouping key keeping related records (e.g. variants of one parent
    /// product) together during segmentation.
    pub group_key: String,
    /// Raw source fields, already mapped to the internal schema.
    pub fields: BTreeMap<String, String>,
    /// Product image URLs attached to the request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    /// Estimated token weight.
    #[serde(default)]
    pub weight: u64,
}

// ---------------------------------------------------------------------------
// Fragment / Chunk
// ---------------------------------------------------------------------------

/// An ordered, non-empty run of records processed as one coherent unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Global processing order.
    pub index: usize,
    /// Records in source order.
    pub records: Vec<Record>,
    /// Cumulative estimated token weight.
    pub weight: u64,
    /// Set when an oversized group was split at record boundaries, so
    /// downstream QA can discount confidence.
    pub context_incomplete: bool,
}

impl Fragment {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// An ordered sequence of fragments grouped for a single batch submission.
///
/// Chunk boundaries never split a fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Global chunk order.
    pub index: usize,
    /// Fragments in global fragment order.
    pub fragments: Vec<Fragment>,
}

impl Chunk {
    /// Sum of fragment weights.
    pub fn weight(&self) -> u64 {
        self.fragments.iter().map(|f| f.weight).sum()
    }

    pub fn record_count(&self) -> usize {
        self.fragments.iter().map(Fragment::record_count).sum()
    }

    /// Records in global order, flattened across fragments.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.fragments.iter().flat_map(|f| f.records.iter())
    }
}

// ---------------------------------------------------------------------------
// ContextDigest
// ---------------------------------------------------------------------------

/// Compact, lossy summary of one chunk's validated results, carried forward
/// so later prompts stay consistent with earlier decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDigest {
    /// Index of the chunk this digest was derived from.
    pub chunk_index: usize,
    /// Terms and marketing phrases already used in accepted outputs.
    pub terms: Vec<String>,
    /// Style decisions observed (field name → representative value).
    pub style_notes: Vec<String>,
    /// Estimated token weight of the digest itself.
    pub weight: u64,
}

// ---------------------------------------------------------------------------
// BatchJob
// ---------------------------------------------------------------------------

/// Lifecycle states of one asynchronous batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Built,
    Submitted,
    Polling,
    Completed,
    Failed,
    Expired,
}

impl BatchState {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// One in-flight (or finished) batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    /// Index of the chunk this job carries.
    pub chunk_index: usize,
    /// Provider-assigned job handle, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_job_id: Option<String>,
    /// When the submission was confirmed by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Retry attempts consumed across submit and poll.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub state: BatchState,
}

impl BatchJob {
    /// A freshly built, not yet submitted job for a chunk.
    pub fn built(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            provider_job_id: None,
            submitted_at: None,
            retry_count: 0,
            state: BatchState::Built,
        }
    }

    /// Whether the provider confirmed the submission (budget was consumed).
    pub fn was_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// Validation outcome for one parsed output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    SchemaError,
    QaFlagged,
    /// The provider returned no output line for this input record.
    MissingOutput,
}

/// Parsed, validated output corresponding to one input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Identifier matching the source [`Record`].
    pub id: RecordId,
    /// Normalized output field mapping.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Validation status.
    pub status: ValidationStatus,
    /// Ordered QA flag descriptions (non-fatal).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qa_notes: Vec<String>,
    /// Provider-reported input token usage for this line.
    #[serde(default)]
    pub tokens_in: u64,
    /// Provider-reported output token usage for this line.
    #[serde(default)]
    pub tokens_out: u64,
}

// ---------------------------------------------------------------------------
// OutputSchema
// ---------------------------------------------------------------------------

/// Output-schema descriptor supplied by the prompt/schema collaborator.
///
/// The raw `schema` value is passed to the provider untouched; the
/// structural hints are what the reconciler validates against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Schema name sent with the structured-output request.
    pub name: String,
    /// Fields every output record must contain.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Expected bounds on each textual output value, in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value_len: Option<usize>,
    /// Opaque JSON schema forwarded to the provider.
    pub schema: serde_json::Value,
}

impl OutputSchema {
    /// A permissive schema with no structural requirements.
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_fields: Vec::new(),
            min_value_len: None,
            max_value_len: None,
            schema: serde_json::json!({"type": "object"}),
        }
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Terminal status of one chunk within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkStatus {
    Completed,
    Failed { reason: String },
    /// Never attempted because an earlier chunk failed or the run was
    /// cancelled.
    Skipped { reason: String },
}

/// Per-chunk summary in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    pub index: usize,
    pub status: ChunkStatus,
    pub records_total: usize,
    pub valid: usize,
    pub qa_flagged: usize,
    pub schema_errors: usize,
    pub missing_output: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// A record rejected before segmentation, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub id: RecordId,
    pub reason: String,
}

/// Completion report for one run. Partial success is a normal, first-class
/// outcome: successes, QA flags, schema errors, and skipped work are all
/// enumerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// All result records from completed chunks, in input order.
    pub results: Vec<ResultRecord>,
    /// One entry per chunk, in chunk order.
    pub chunks: Vec<ChunkReport>,
    /// Records rejected before segmentation.
    pub rejected: Vec<RejectedRecord>,
    /// Total provider-reported token usage.
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl RunReport {
    /// Whether every chunk completed.
    pub fn is_complete(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Completed)
    }

    /// Count results with the given status.
    pub fn count_status(&self, status: ValidationStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
