//! Error types for the change-relay pipeline
//!
//! One error enum for the whole pipeline, with classification helpers for
//! retry decisions and metrics labels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Batch-source / data-layer errors
    Data,
    /// Identifier mapping and generation errors
    Mapping,
    /// Outbox / sender delivery errors
    Delivery,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Serialization errors (JSON, payload encoding)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Pipeline errors.
///
/// `LockUnavailable` is not a failure: it signals that another instance in
/// the fleet holds the entity lock and the tick should be skipped.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Transient data-layer error (poison/concurrency code); retried next tick
    #[error("Transient data error: {0}")]
    TransientData(String),

    /// A single change row failed validation or column mapping
    #[error("Malformed change row in {table}: {reason}")]
    MalformedRow { table: String, reason: String },

    /// Identifier generator unavailable or refused
    #[error("Identifier generation error: {0}")]
    Generation(String),

    /// Sender or outbox failure; batch-complete is not invoked
    #[error("Publish error: {0}")]
    Publish(String),

    /// Another instance holds the entity lock (normal skip, not a failure)
    #[error("Lock unavailable for {0}")]
    LockUnavailable(String),

    /// No consumer registered for a (subject, action) pair
    #[error("No consumer registered for subject '{subject}' action '{action}'")]
    NoConsumer { subject: String, action: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (file-backed stores)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cycle exceeded its configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Cycle cancelled at a stage boundary
    #[error("Cycle cancelled")]
    Cancelled,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Create a transient data error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientData(msg.into())
    }

    /// Create a malformed-row error.
    pub fn malformed_row(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Create a generation error.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a publish error.
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable at the next tick.
    ///
    /// A failed cycle never advances the watermark, so retrying means
    /// re-fetching the same range.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientData(_) => true,
            Self::Timeout(_) => true,
            Self::Cancelled => true,
            Self::Publish(_) => true,
            Self::Generation(_) => true,
            Self::LockUnavailable(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::MalformedRow { .. }
            | Self::NoConsumer { .. }
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Whether this error represents a normal single-flight skip.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::LockUnavailable(_))
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TransientData(_) => ErrorCategory::Data,
            Self::MalformedRow { .. } => ErrorCategory::Data,
            Self::Generation(_) => ErrorCategory::Mapping,
            Self::Publish(_) => ErrorCategory::Delivery,
            Self::LockUnavailable(_) => ErrorCategory::Other,
            Self::NoConsumer { .. } => ErrorCategory::Configuration,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Data,
            Self::Timeout(_) => ErrorCategory::Data,
            Self::Cancelled => ErrorCategory::Other,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientData(_) => "transient_data",
            Self::MalformedRow { .. } => "malformed_row",
            Self::Generation(_) => "generation_error",
            Self::Publish(_) => "publish_error",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::NoConsumer { .. } => "no_consumer",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
