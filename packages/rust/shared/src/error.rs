//! Error types for Fieldsmith.
//!
//! Library crates use [`FieldsmithError`] via `thiserror`.
//! App crates wrap this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Fieldsmith operations.
#[derive(Debug, thiserror::Error)]
pub enum FieldsmithError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A single record's estimated weight can never fit any submission.
    #[error("record {id} too large: estimated {weight} tokens exceeds ceiling {ceiling}")]
    RecordTooLarge {
        id: String,
        weight: u64,
        ceiling: u64,
    },

    /// Batch submission failed after exhausting retries.
    #[error("submission failed: {0}")]
    Submission(String),

    /// The provider's poll response could not be interpreted.
    #[error("poll failed: {0}")]
    Poll(String),

    /// The provider reported the job still running past its maximum age.
    #[error("job expired: {0}")]
    JobExpired(String),

    /// Network/HTTP error talking to the inference provider.
    #[error("provider error: {0}")]
    Provider(String),

    /// Output line parsing or schema validation error.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Data validation error (malformed input records, bad artifacts, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FieldsmithError>;

impl FieldsmithError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a schema error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a transient provider-side condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = FieldsmithError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = FieldsmithError::RecordTooLarge {
            id: "sku-99".into(),
            weight: 80_000,
            ceiling: 50_000,
        };
        assert!(err.to_string().contains("sku-99"));
        assert!(err.to_string().contains("80000"));
    }

    #[test]
    fn transient_classification() {
        assert!(FieldsmithError::Provider("HTTP 429".into()).is_transient());
        assert!(!FieldsmithError::JobExpired("batch_1".into()).is_transient());
        assert!(!FieldsmithError::schema("bad line").is_transient());
        // Poll is reserved for protocol-level breakage (malformed status
        // payloads); transport failures while polling arrive as Provider.
        assert!(!FieldsmithError::Poll("unknown batch status".into()).is_transient());
    }
}
