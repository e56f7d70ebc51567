//! Batch inference provider client and lifecycle driver.
//!
//! This crate provides:
//! - [`payload`] — Provider wire format ([`ChunkPayload`], [`RecordRequest`])
//! - [`BatchProvider`] — The submit/poll/fetch abstraction over an
//!   asynchronous batch endpoint, with [`HttpBatchProvider`] speaking an
//!   OpenAI-style API
//! - [`LifecycleDriver`] — Drives one job to a terminal state with bounded
//!   exponential backoff, retry limits, and age-based expiry

pub mod client;
pub mod lifecycle;
pub mod payload;

pub use client::{BatchProvider, HttpBatchProvider, JobHandle, JobState, JobStatus};
pub use lifecycle::{DriveResult, LifecycleDriver, backoff_delay};
pub use payload::{ChunkPayload, RecordRequest};
