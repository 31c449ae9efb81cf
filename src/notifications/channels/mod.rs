//! Notification channels for delivering alerts

pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::notifications::Alert;

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur during channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel temporarily unavailable
    #[error("Channel temporarily unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ChannelError {
    /// Client errors (4xx) will not succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !(400..500).contains(status),
            Self::InvalidConfig(_) | Self::SerializationError(_) => false,
            Self::HttpError(_) | Self::Unavailable(_) => true,
        }
    }
}

/// Response from sending a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub success: bool,
    pub channel: String,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DeliveryStatus {
    pub fn success(channel: impl Into<String>) -> Self {
        Self {
            success: true,
            channel: channel.into(),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn success_with_message(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            channel: channel.into(),
            message: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn failure(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            channel: channel.into(),
            message: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "SUCCESS" } else { "FAILED" };
        write!(f, "[{status}] {}", self.channel)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Trait for alert channels
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Send an alert through this channel
    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status_display() {
        let success = DeliveryStatus::success_with_message("webhook", "Delivered");
        assert!(success.to_string().contains("SUCCESS"));
        assert!(success.to_string().contains("webhook"));

        let failure = DeliveryStatus::failure("webhook", "HTTP 500");
        assert!(!failure.success);
        assert!(failure.to_string().contains("FAILED"));
        assert!(failure.to_string().contains("HTTP 500"));
    }

    #[test]
    fn test_status_retryability() {
        let client = ChannelError::Status {
            status: 404,
            body: "missing".to_string(),
        };
        let server = ChannelError::Status {
            status: 503,
            body: "busy".to_string(),
        };
        assert!(!client.is_retryable());
        assert!(server.is_retryable());
        assert!(!ChannelError::InvalidConfig("x".to_string()).is_retryable());
    }
}
