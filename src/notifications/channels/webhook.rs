//! Webhook notification channel
//!
//! Posts JSON payloads over HTTP. Alerts use it directly; the webhook
//! delivery collaborator reuses [`WebhookChannel::post_json`] for events.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{Channel, ChannelError, ChannelResult, DeliveryStatus};
use crate::notifications::Alert;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Webhook channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    pub url: String,
    /// Optional bearer token
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Custom headers to include in requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt; client errors are never retried
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
            retry_base_delay_ms: default_retry_delay(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }

        if url::Url::parse(&self.url).is_err()
            || !(self.url.starts_with("http://") || self.url.starts_with("https://"))
        {
            return Err(format!("Webhook URL must be an http(s) URL: {}", self.url));
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_base_delay_ms.saturating_mul(8),
            backoff_multiplier: 2.0,
        }
    }
}

/// Webhook channel
///
/// # Payload Format
///
/// ```json
/// {
///   "id": "alert-uuid",
///   "severity": "critical",
///   "status": "triggered",
///   "message": "No prayer times available for 2025-03-10",
///   "kind": { "type": "service_risk", "date": "2025-03-10" },
///   "metadata": {},
///   "created_at": "2025-03-10T00:00:00Z",
///   "triggered_at": "2025-03-10T00:00:01Z"
/// }
/// ```
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn from_url(url: impl Into<String>) -> ChannelResult<Self> {
        Self::new(WebhookConfig::new(url))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "id": alert.id,
            "severity": alert.severity.as_str(),
            "status": alert.status.as_str(),
            "message": alert.message,
            "kind": alert.kind,
            "metadata": alert.metadata,
            "created_at": alert.created_at.to_rfc3339(),
            "triggered_at": alert.triggered_at.map(|t| t.to_rfc3339()),
            "resolved_at": alert.resolved_at.map(|t| t.to_rfc3339()),
        })
    }

    /// POST a JSON payload, retrying server and transport errors with backoff
    pub async fn post_json(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        with_retry_if(
            &self.config.retry_config(),
            || self.post_once(payload),
            ChannelError::is_retryable,
        )
        .await
    }

    async fn post_once(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let mut request = self.client.post(&self.config.url);

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %self.config.url, status = %status, "Webhook delivered");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        Err(ChannelError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(alert);

        match self.post_json(&payload).await {
            Ok(()) => Ok(DeliveryStatus::success_with_message(
                "webhook",
                format!("Delivered to {}", self.config.url),
            )),
            Err(e) => {
                tracing::error!(url = %self.config.url, error = %e, "Failed to deliver webhook");
                Ok(DeliveryStatus::failure("webhook", e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{AlertKind, AlertSeverity};

    #[test]
    fn test_webhook_config_validation() {
        assert!(WebhookConfig::new("https://example.com/webhook")
            .validate()
            .is_ok());
        assert!(WebhookConfig::new("").validate().is_err());
        assert!(WebhookConfig::new("example.com/webhook").validate().is_err());
        assert!(WebhookConfig::new("https://example.com")
            .with_timeout(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_webhook_config_builder() {
        let config = WebhookConfig::new("https://example.com/webhook")
            .with_auth_token("secret-token")
            .with_header("X-Custom", "value")
            .with_timeout(30)
            .with_max_retries(5);

        assert_eq!(config.auth_token, Some("secret-token".to_string()));
        assert_eq!(config.headers.get("X-Custom"), Some(&"value".to_string()));
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_webhook_from_url() {
        assert!(WebhookChannel::from_url("https://example.com/alerts").is_ok());
        assert!(matches!(
            WebhookChannel::from_url("not-a-url"),
            Err(ChannelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_webhook_payload_building() {
        let channel = WebhookChannel::from_url("https://example.com/webhook").unwrap();

        let mut alert = Alert::new(
            AlertKind::SourceOpenTooLong {
                source: "aladhan".to_string(),
                open_secs: 1900,
            },
            AlertSeverity::Warning,
            "source open".to_string(),
        );
        alert.trigger();

        let payload = channel.build_payload(&alert);

        assert_eq!(payload["severity"], "warning");
        assert_eq!(payload["status"], "triggered");
        assert_eq!(payload["kind"]["type"], "source_open_too_long");
        assert_eq!(payload["kind"]["source"], "aladhan");
        assert!(payload["triggered_at"].is_string());
    }

    #[test]
    fn test_webhook_config_deserializes_with_defaults() {
        let config: WebhookConfig =
            toml::from_str(r#"url = "https://hooks.example.com/ops""#).unwrap();
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_retries, 3);
        assert!(config.headers.is_empty());
    }
}
