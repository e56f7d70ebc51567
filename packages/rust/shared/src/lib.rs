//! Shared types, error model, and configuration for Fieldsmith.
//!
//! This crate is the foundation depended on by all other Fieldsmith crates.
//! It provides:
//! - [`FieldsmithError`] — the unified error type
//! - Domain types ([`Record`], [`Fragment`], [`Chunk`], [`ContextDigest`],
//!   [`BatchJob`], [`ResultRecord`], [`RunReport`])
//! - Configuration ([`AppConfig`], [`BudgetConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetConfig, BudgetsConfig, ContextConfig, DefaultsConfig, PollingConfig,
    ProviderConfig, RetentionPolicy, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{FieldsmithError, Result};
pub use types::{
    BatchJob, BatchState, CURRENT_SCHEMA_VERSION, Chunk, ChunkReport, ChunkStatus, ContextDigest,
    Fragment, OutputSchema, Record, RecordId, RejectedRecord, ResultRecord, RunId, RunReport,
    ValidationStatus,
};
