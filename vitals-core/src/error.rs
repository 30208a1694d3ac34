//! Error types for vitals.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vitals operations.
pub type Result<T> = std::result::Result<T, VitalsError>;

/// Main error type for vitals.
#[derive(Error, Debug)]
pub enum VitalsError {
    // Protocol errors (surface to clients as 4xx)
    #[error("incorrect request type")]
    UnknownMetricKind { kind: String },

    #[error("invalid value: {raw}")]
    InvalidMetricValue { raw: String },

    // Integrity errors
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("envelope error: {reason}")]
    Envelope { reason: String },

    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    // Backend errors
    #[error("database error: {0}")]
    Database(String),

    #[error("there is no connection to remote db, in-memory storage is used")]
    RemoteDbNotConfigured,

    // Snapshot errors (non-fatal by policy, see the backup writer)
    #[error("snapshot error at {path:?}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Delivery errors
    #[error("delivery failed after {attempts} attempts: {reason}")]
    DeliveryExhausted { attempts: u32, reason: String },

    // Lifecycle sentinel, not a user-facing failure
    #[error("graceful shutdown")]
    GracefulShutdown,

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VitalsError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// True for the cancellation sentinel returned by long-running tasks.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::GracefulShutdown)
    }
}
