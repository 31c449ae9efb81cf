//! Error types for the scheduler module

use chrono::NaiveDate;
use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// No fresh, stale or borrowed prayer times exist for the date
    NoScheduleAvailable {
        date: NaiveDate,
    },

    /// Group timezone is not a known IANA name
    InvalidTimezone {
        tz: String,
    },

    /// Reading cache, policy or ledger state failed
    StorageError {
        operation: String,
        reason: String,
    },

    /// Trigger configuration error
    TriggerConfigError {
        field: String,
        reason: String,
    },

    /// A maintenance task failed
    TriggerExecutionFailed {
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoScheduleAvailable { date } => {
                write!(f, "No prayer times available for {}", date)
            }
            Self::InvalidTimezone { tz } => {
                write!(f, "Invalid timezone: {}", tz)
            }
            Self::StorageError { operation, reason } => {
                write!(f, "Storage error during '{}': {}", operation, reason)
            }
            Self::TriggerConfigError { field, reason } => {
                write!(f, "Trigger config error in '{}': {}", field, reason)
            }
            Self::TriggerExecutionFailed { reason } => {
                write!(f, "Trigger execution failed: {}", reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    pub fn no_schedule(date: NaiveDate) -> Self {
        Self::NoScheduleAvailable { date }
    }

    pub fn invalid_timezone(tz: impl Into<String>) -> Self {
        Self::InvalidTimezone { tz: tz.into() }
    }

    /// Wrap a storage failure with the operation that hit it
    pub fn storage(operation: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::StorageError {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    pub fn trigger_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TriggerConfigError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying later can succeed.
    ///
    /// A missing schedule clears once a source recovers; a bad timezone
    /// never does.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoScheduleAvailable { .. }
                | Self::StorageError { .. }
                | Self::TriggerExecutionFailed { .. }
        )
    }
}
