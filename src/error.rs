//! Unified error handling for the mawaqit crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`MawaqitErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification shared with the health error log
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use mawaqit::error::{Error, MawaqitErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = err.category().as_str(), "{err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::cache::CacheError;
pub use crate::groups::PolicyError;
pub use crate::scheduler::dispatcher::{DeliveryError, DispatchError};
pub use crate::scheduler::error::SchedulerError;
pub use crate::source::{ResolveError, SourceError, SourceFailure};
pub use crate::validator::InvalidTimesError;

/// Common trait for mawaqit error types
pub trait MawaqitErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried later)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Upstream API answered with an error status
    Api,
    /// Timeouts and connection failures
    Network,
    /// Implausible or malformed prayer times
    Validation,
    Cache,
    Database,
    Scheduling,
    Delivery,
    Config,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Cache => "cache",
            Self::Database => "database",
            Self::Scheduling => "scheduling",
            Self::Delivery => "delivery",
            Self::Config => "config",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the mawaqit crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Invalid prayer times: {0}")]
    InvalidTimes(#[from] InvalidTimesError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MawaqitErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Source(e) => !matches!(e.cause, SourceFailure::Malformed(_)),
            Self::Resolve(_) => true,
            Self::InvalidTimes(_) => false,
            Self::Cache(e) => matches!(e, CacheError::Storage(_)),
            Self::Policy(e) => !e.is_config_error(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Dispatch(e) => matches!(e.cause, DeliveryError::Transient(_)),
            Self::Database(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Http(_) => true, // HTTP errors are often transient
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Source(e) => match e.cause {
                SourceFailure::Timeout(_) | SourceFailure::Connect(_) => ErrorCategory::Network,
                SourceFailure::Status(_) | SourceFailure::RateLimited => ErrorCategory::Api,
                SourceFailure::Malformed(_) => ErrorCategory::Validation,
            },
            Self::Resolve(_) | Self::Http(_) => ErrorCategory::Network,
            Self::InvalidTimes(_) => ErrorCategory::Validation,
            Self::Cache(_) => ErrorCategory::Cache,
            Self::Policy(e) if e.is_config_error() => ErrorCategory::Config,
            Self::Policy(_) | Self::Database(_) => ErrorCategory::Database,
            Self::Scheduler(SchedulerError::InvalidTimezone { .. }) => ErrorCategory::Config,
            Self::Scheduler(SchedulerError::StorageError { .. }) => ErrorCategory::Database,
            Self::Scheduler(_) => ErrorCategory::Scheduling,
            Self::Dispatch(_) => ErrorCategory::Delivery,
            Self::Json(_) => ErrorCategory::Validation,
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Other { .. } => ErrorCategory::System,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
