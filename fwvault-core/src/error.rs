/*!
Error types for the fwvault core engine.
*/

use std::time::Duration;
use thiserror::Error;

use fwvault_retry::RetryableError;

/// Result type used throughout the fwvault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors raised by a device transport while fetching or pushing configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not complete within the caller-enforced deadline
    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    /// The device rejected the supplied credential
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// The device or manager could not be reached
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The device answered, but not in the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::AuthFailure(msg.into())
    }

    pub fn unreachable<S: Into<String>>(msg: S) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }
}

impl RetryableError for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unreachable(_))
    }
}

/// Errors that can occur during backup, storage and restore operations.
#[derive(Error, Debug)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid stored artifact format
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// Artifact store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed or empty configuration capture
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No credential available for device {0}")]
    CredentialMissing(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The snapshot is held by an in-progress operation
    #[error("Snapshot {0} is pinned")]
    SnapshotPinned(String),

    /// Another backup or restore holds the device
    #[error("Device {0} already has an operation in flight")]
    DeviceBusy(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Restore attempted without a token bound to the current diff
    #[error("Confirmation rejected: {0}")]
    Confirmation(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    Cron { expr: String, reason: String },

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl VaultError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new confirmation error
    pub fn confirmation<S: Into<String>>(msg: S) -> Self {
        Self::Confirmation(msg.into())
    }

    /// True for errors that indicate a possible gap in the audit trail
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::Compression(_)
                | Self::IntegrityCheckFailed { .. }
                | Self::InvalidFormat(_)
        )
    }
}

impl RetryableError for VaultError {
    /// Storage writes are retried; everything else surfaces immediately
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_transient(),
            Self::Storage(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}
