//! Batch sequencing engine for context-preserving record enrichment.
//!
//! This crate turns an ordered set of ingested records into a sequence of
//! batch inference jobs and reconciles their outputs:
//! - [`budget`] — Token estimation and the rolling-window usage tracker
//! - [`segmenter`] — Records → fragments under the per-request ceiling
//! - [`context`] — Digest extraction, retention, and prompt injection
//! - [`payload`] — Fragments + inherited context → provider request bodies
//! - [`sequencer`] — The run orchestrator: chunking, sequential dispatch,
//!   failure isolation, cancellation
//! - [`reconciler`] — Raw output lines → validated [`ResultRecord`]s
//! - [`persist`] — Per-run artifacts: payloads, raw outputs, checkpoints,
//!   reports
//!
//! [`ResultRecord`]: fieldsmith_shared::ResultRecord

pub mod budget;
pub mod context;
pub mod payload;
pub mod persist;
pub mod reconciler;
pub mod segmenter;
pub mod sequencer;

pub use budget::{estimate_record, estimate_text, BudgetScope, BudgetTracker};
pub use context::ContextCarrier;
pub use payload::PayloadBuilder;
pub use persist::{ChunkCheckpoint, RunCheckpoint, RunPlan, RunStore};
pub use reconciler::{reconcile, ReconcileOutcome};
pub use segmenter::{segment, SegmentOutcome};
pub use sequencer::{
    chunk_fragments, replay, replay_run, NullObserver, RunEvent, RunObserver, Sequencer,
    SequencerState,
};
