//! Error types for flowstate
//!
//! This module defines the error hierarchy for the flow table.
//! Errors are split by subsystem and carry a recovery hint so callers
//! (the rule matcher) can decide between fail-open and fail-closed.

use std::io;

use thiserror::Error;

/// Top-level error type for flowstate
#[derive(Debug, Error)]
pub enum FlowStateError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State installation or table restructuring errors
    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FlowStateError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Install(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Errors returned when the table refuses to create state.
///
/// `OutOfCapacity` and `LimitExceeded` are returned by
/// [`FlowTable::install`](crate::FlowTable::install); the table never makes an
/// untracked flow look tracked. `InvalidBucketCount` is only produced by
/// [`FlowTable::resize`](crate::FlowTable::resize).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    /// The table already holds its configured maximum number of records
    #[error("Flow table full: {max} records")]
    OutOfCapacity { max: usize },

    /// Admission control rejected the flow
    #[error("Limit group full: {limit} concurrent flows")]
    LimitExceeded { limit: u32 },

    /// Requested bucket count is not a power of two in [1, 65536]
    #[error("Invalid bucket count: {0}")]
    InvalidBucketCount(usize),
}

impl InstallError {
    /// Capacity and limit rejections clear up as flows expire.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfCapacity { .. } | Self::LimitExceeded { .. })
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, out-of-range bounds)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Result alias for install operations
pub type InstallResult<T> = Result<T, InstallError>;
