//! Error handling module for the migration data path
//!
//! Provides the error taxonomy shared by every stage of a disk pipeline.
//! Each variant says whether the condition is fatal for a disk, fatal for a
//! stage, or retryable; see `is_retryable()`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Tracking is enabled but no backing device matches the disk label.
    /// Fatal for that disk, siblings in the same session continue.
    #[error("Disk not found: no backing device matches label '{label}'")]
    DiskNotFound { label: String },

    /// A bounded wait expired (export liveness, mostly). Recoverable.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// An external process exited non-zero
    #[error("{program} failed (exit code {}): {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()), stderr_tail.trim())]
    SubprocessFailed {
        program: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// The stage was cancelled by an external signal. Never retried.
    #[error("Cancelled during {stage}")]
    Cancelled { stage: String },

    /// The target device never appeared in the device namespace
    #[error("Device for volume {volume_id} not resolvable after {attempts} attempts")]
    DeviceUnresolved { volume_id: String, attempts: u32 },

    /// A second export was requested for a disk that already has a live one
    #[error("Export already active for disk {disk_key}")]
    ExportAlreadyActive { disk_key: String },

    /// Volume identifiers shorter than the match prefix cannot be resolved
    #[error("Volume ID '{0}' is shorter than the {1}-character match prefix")]
    InvalidVolumeId(String, usize),

    /// Configuration / request errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to launch an external program
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// NBD wire protocol violations
    #[error("NBD protocol error: {0}")]
    Protocol(String),

    /// Session state machine misuse
    #[error("Session transition error: {0}")]
    Transition(String),

    /// IO errors (files, sockets, device namespace)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an NBD protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a cancellation error for the named stage
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Conditions the caller may retry with a bounded budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeviceUnresolved { .. })
    }

    /// True for the cancellation outcome, which is distinct from failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::config("max_parallel_transfers must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_parallel_transfers must be at least 1"
        );

        let err = MigrationError::DiskNotFound {
            label: "[ds1] vm/vm.vmdk".to_string(),
        };
        assert!(err.to_string().contains("[ds1] vm/vm.vmdk"));
    }

    #[test]
    fn test_subprocess_failed_display_includes_tail() {
        let err = MigrationError::SubprocessFailed {
            program: "nbdcopy".to_string(),
            exit_code: Some(1),
            stderr_tail: "nbdcopy: write: No space left on device\n".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nbdcopy failed (exit code 1)"));
        assert!(msg.ends_with("No space left on device"));

        let err = MigrationError::SubprocessFailed {
            program: "virt-v2v-in-place".to_string(),
            exit_code: None,
            stderr_tail: String::new(),
        };
        assert!(err.to_string().contains("exit code signal"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MigrationError = io_err.into();
        assert!(matches!(err, MigrationError::Io(_)));
    }

    #[test]
    fn test_retry_classification() {
        assert!(MigrationError::timeout("export", Duration::from_secs(30)).is_retryable());
        assert!(
            MigrationError::DeviceUnresolved {
                volume_id: "v".into(),
                attempts: 3
            }
            .is_retryable()
        );
        assert!(!MigrationError::cancelled("copy").is_retryable());
        assert!(MigrationError::cancelled("copy").is_cancelled());
        assert!(
            !MigrationError::DiskNotFound {
                label: "x".into()
            }
            .is_retryable()
        );
    }
}
