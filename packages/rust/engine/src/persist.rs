//! Run persistence: payload, output, checkpoint, and report artifacts.
//!
//! Every run gets its own directory under the configured output root, keyed
//! by the time-sortable run identifier:
//!
//! ```text
//! <root>/<run_id>/
//!   payloads/chunk_000.jsonl    submitted request payloads
//!   outputs/chunk_000.jsonl     raw provider output lines
//!   checkpoint.json             per-chunk job state, updated as chunks finish
//!   report.json                 final run report
//! ```
//!
//! Raw outputs are written to disk before reconciliation, so a completed
//! chunk's results can always be rebuilt offline by replaying the artifact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use fieldsmith_shared::{
    BatchJob, Chunk, FieldsmithError, OutputSchema, RejectedRecord, Result, RunId, RunReport,
    CURRENT_SCHEMA_VERSION,
};
use fieldsmith_provider::ChunkPayload;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The segmentation and chunking decisions for a run, persisted before any
/// submission so results can be reconciled offline later.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunPlan {
    pub schema_version: u32,
    pub run_id: RunId,
    /// Chunks in dispatch order, including their full record contents.
    pub chunks: Vec<Chunk>,
    /// Records rejected before segmentation.
    pub rejected: Vec<RejectedRecord>,
    /// Output schema the run validates against.
    pub schema: OutputSchema,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Per-chunk entry in the checkpoint file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChunkCheckpoint {
    pub job: BatchJob,
    /// SHA-256 of the persisted raw output artifact, for integrity checks
    /// during replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
    /// Failure description for jobs that did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Durable run progress, rewritten after every chunk reaches a terminal
/// state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunCheckpoint {
    pub schema_version: u32,
    pub run_id: RunId,
    pub updated_at: DateTime<Utc>,
    /// One entry per finished chunk, in chunk order.
    pub chunks: Vec<ChunkCheckpoint>,
}

impl RunCheckpoint {
    pub fn new(run_id: RunId) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id,
            updated_at: Utc::now(),
            chunks: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Filesystem handle for one run's artifacts.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
    run_id: RunId,
}

impl RunStore {
    /// Create the directory layout for a new run.
    pub fn create(root: &Path, run_id: RunId) -> Result<Self> {
        let dir = root.join(run_id.to_string());
        for sub in ["payloads", "outputs"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        }
        info!(run_id = %run_id, dir = %dir.display(), "run store created");
        Ok(Self { dir, run_id })
    }

    /// Open an existing run's artifacts, e.g. for replay.
    pub fn open(root: &Path, run_id: RunId) -> Result<Self> {
        let dir = root.join(run_id.to_string());
        if !dir.is_dir() {
            return Err(FieldsmithError::validation(format!(
                "no run directory at {}",
                dir.display()
            )));
        }
        Ok(Self { dir, run_id })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn payload_path(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("payloads/chunk_{chunk_index:03}.jsonl"))
    }

    fn output_path(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("outputs/chunk_{chunk_index:03}.jsonl"))
    }

    fn plan_path(&self) -> PathBuf {
        self.dir.join("plan.json")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    fn report_path(&self) -> PathBuf {
        self.dir.join("report.json")
    }

    /// Persist the exact JSONL body submitted for a chunk.
    pub fn write_payload(&self, payload: &ChunkPayload) -> Result<()> {
        let path = self.payload_path(payload.chunk_index);
        let body = payload.to_jsonl()?;
        fs::write(&path, &body).map_err(|e| FieldsmithError::io(&path, e))?;
        debug!(chunk = payload.chunk_index, bytes = body.len(), "payload persisted");
        Ok(())
    }

    /// Persist a completed chunk's raw output lines. Returns the artifact's
    /// SHA-256 for the checkpoint.
    pub fn write_raw_output(&self, chunk_index: usize, lines: &[String]) -> Result<String> {
        let path = self.output_path(chunk_index);
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&path, &body).map_err(|e| FieldsmithError::io(&path, e))?;

        let digest = Sha256::digest(body.as_bytes());
        let hex = format!("{digest:x}");
        debug!(chunk = chunk_index, lines = lines.len(), sha256 = %hex, "raw output persisted");
        Ok(hex)
    }

    /// Read back a chunk's raw output lines for replay.
    pub fn read_raw_output(&self, chunk_index: usize) -> Result<Vec<String>> {
        let path = self.output_path(chunk_index);
        let body = fs::read_to_string(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn write_plan(&self, plan: &RunPlan) -> Result<()> {
        let path = self.plan_path();
        let json = serde_json::to_string_pretty(plan)
            .map_err(|e| FieldsmithError::validation(format!("plan serialization: {e}")))?;
        fs::write(&path, json).map_err(|e| FieldsmithError::io(&path, e))
    }

    pub fn read_plan(&self) -> Result<RunPlan> {
        let path = self.plan_path();
        let json = fs::read_to_string(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        serde_json::from_str(&json)
            .map_err(|e| FieldsmithError::validation(format!("plan parse: {e}")))
    }

    pub fn write_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let path = self.checkpoint_path();
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| FieldsmithError::validation(format!("checkpoint serialization: {e}")))?;
        fs::write(&path, json).map_err(|e| FieldsmithError::io(&path, e))
    }

    pub fn read_checkpoint(&self) -> Result<RunCheckpoint> {
        let path = self.checkpoint_path();
        let json = fs::read_to_string(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        serde_json::from_str(&json)
            .map_err(|e| FieldsmithError::validation(format!("checkpoint parse: {e}")))
    }

    pub fn write_report(&self, report: &RunReport) -> Result<()> {
        let path = self.report_path();
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| FieldsmithError::validation(format!("report serialization: {e}")))?;
        fs::write(&path, json).map_err(|e| FieldsmithError::io(&path, e))?;
        info!(run_id = %self.run_id, path = %path.display(), "run report written");
        Ok(())
    }

    pub fn read_report(&self) -> Result<RunReport> {
        let path = self.report_path();
        let json = fs::read_to_string(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        serde_json::from_str(&json)
            .map_err(|e| FieldsmithError::validation(format!("report parse: {e}")))
    }

    /// Verify a persisted output artifact against its checkpointed hash.
    pub fn verify_output(&self, chunk_index: usize, expected_sha256: &str) -> Result<()> {
        let path = self.output_path(chunk_index);
        let body = fs::read(&path).map_err(|e| FieldsmithError::io(&path, e))?;
        let hex = format!("{:x}", Sha256::digest(&body));
        if hex != expected_sha256 {
            return Err(FieldsmithError::validation(format!(
                "output artifact for chunk {chunk_index} does not match checkpoint ({hex} != {expected_sha256})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsmith_provider::RecordRequest;

    fn payload(chunk_index: usize) -> ChunkPayload {
        ChunkPayload {
            chunk_index,
            requests: vec![
                RecordRequest::new("sku-1", serde_json::json!({"model": "m"})),
                RecordRequest::new("sku-2", serde_json::json!({"model": "m"})),
            ],
        }
    }

    #[test]
    fn create_builds_directory_layout() {
        let root = tempfile::tempdir().expect("tempdir");
        let run_id = RunId::new();
        let store = RunStore::create(root.path(), run_id.clone()).expect("create");

        assert!(store.dir().join("payloads").is_dir());
        assert!(store.dir().join("outputs").is_dir());
        assert_eq!(store.run_id(), &run_id);
    }

    #[test]
    fn open_rejects_missing_run() {
        let root = tempfile::tempdir().expect("tempdir");
        let err = RunStore::open(root.path(), RunId::new()).unwrap_err();
        assert!(err.to_string().contains("no run directory"));
    }

    #[test]
    fn payload_artifact_is_jsonl() {
        let root = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(root.path(), RunId::new()).expect("create");
        store.write_payload(&payload(0)).expect("write");

        let body = std::fs::read_to_string(store.dir().join("payloads/chunk_000.jsonl"))
            .expect("read back");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""custom_id":"sku-1""#));
    }

    #[test]
    fn raw_output_roundtrip_with_hash() {
        let root = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(root.path(), RunId::new()).expect("create");

        let lines = vec![r#"{"custom_id":"sku-1"}"#.to_string()];
        let hash = store.write_raw_output(3, &lines).expect("write");
        assert_eq!(store.read_raw_output(3).expect("read"), lines);
        store.verify_output(3, &hash).expect("verify");

        let err = store.verify_output(3, "0000").unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn checkpoint_roundtrip() {
        let root = tempfile::tempdir().expect("tempdir");
        let run_id = RunId::new();
        let store = RunStore::create(root.path(), run_id.clone()).expect("create");

        let mut checkpoint = RunCheckpoint::new(run_id.clone());
        checkpoint.chunks.push(ChunkCheckpoint {
            job: BatchJob::built(0),
            output_sha256: Some("abc123".into()),
            failure: None,
        });
        store.write_checkpoint(&checkpoint).expect("write");

        let parsed = store.read_checkpoint().expect("read");
        assert_eq!(parsed.run_id, run_id);
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].output_sha256.as_deref(), Some("abc123"));
    }

    #[test]
    fn plan_roundtrip() {
        let root = tempfile::tempdir().expect("tempdir");
        let run_id = RunId::new();
        let store = RunStore::create(root.path(), run_id.clone()).expect("create");

        let plan = RunPlan {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: run_id.clone(),
            chunks: vec![Chunk {
                index: 0,
                fragments: vec![],
            }],
            rejected: vec![],
            schema: OutputSchema::permissive("fields"),
        };
        store.write_plan(&plan).expect("write");

        let parsed = store.read_plan().expect("read");
        assert_eq!(parsed.run_id, run_id);
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.schema.name, "fields");
    }

    #[test]
    fn reopened_store_sees_existing_artifacts() {
        let root = tempfile::tempdir().expect("tempdir");
        let run_id = RunId::new();
        {
            let store = RunStore::create(root.path(), run_id.clone()).expect("create");
            store
                .write_raw_output(0, &["line".to_string()])
                .expect("write");
        }

        let reopened = RunStore::open(root.path(), run_id).expect("open");
        assert_eq!(reopened.read_raw_output(0).expect("read"), vec!["line"]);
    }
}
