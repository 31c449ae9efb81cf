//! Operator alerts and their delivery channels
//!
//! The health monitor raises alerts when the service is at risk of missing
//! events. Alerts are stored for operational tooling and fanned out to the
//! configured channels.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │      HealthMonitor                         │
//! │  - condition evaluation                    │
//! │  - alert lifecycle (trigger / resolve)     │
//! └────────────────────────────────────────────┘
//!                     │
//!                     ▼
//!              ┌─────────────┐
//!              │  Notifier   │
//!              └─────────────┘
//!                     │
//!             ┌───────┴───────┐
//!             ▼               ▼
//!       ┌─────────┐     ┌─────────┐
//!       │ Webhook │     │  (...)  │
//!       │ Channel │     │         │
//!       └─────────┘     └─────────┘
//! ```
//!
//! # Alert lifecycle
//!
//! Created → Triggered → (Acknowledged) → Resolved

pub mod channels;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub use channels::webhook::{WebhookChannel, WebhookConfig};
pub use channels::{Channel, ChannelError, ChannelResult, DeliveryStatus};

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert status in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Created,
    Triggered,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Triggered => "triggered",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Condition that raised an alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// A source circuit has stayed open past the configured duration
    SourceOpenTooLong { source: String, open_secs: i64 },

    /// No valid cache entry and no available source for a needed date
    ServiceRisk { date: String },

    /// A critical failure was recorded by the error handler
    CriticalError { category: String },
}

impl AlertKind {
    /// Identity used to avoid raising the same alert twice while active
    pub fn key(&self) -> String {
        match self {
            Self::SourceOpenTooLong { source, .. } => format!("source_open:{source}"),
            Self::ServiceRisk { date } => format!("service_risk:{date}"),
            Self::CriticalError { category } => format!("critical_error:{category}"),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::SourceOpenTooLong { source, open_secs } => {
                format!("source '{source}' circuit open for {open_secs}s")
            }
            Self::ServiceRisk { date } => {
                format!("no valid prayer times and no available source for {date}")
            }
            Self::CriticalError { category } => format!("critical {category} failure"),
        }
    }
}

/// An alert instance with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            status: AlertStatus::Created,
            message,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            triggered_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn trigger(&mut self) {
        self.status = AlertStatus::Triggered;
        self.triggered_at = Some(Utc::now());
    }

    pub fn acknowledge(&mut self, acknowledged_by: String) {
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(acknowledged_by);
    }

    pub fn resolve(&mut self) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(Utc::now());
    }

    /// Triggered or acknowledged, but not yet resolved
    pub fn is_open(&self) -> bool {
        matches!(self.status, AlertStatus::Triggered | AlertStatus::Acknowledged)
    }

    /// Format alert for display
    pub fn format_message(&self) -> String {
        format!(
            "[{severity}] {message}\nCondition: {condition}\nStatus: {status}\nCreated: {created}",
            severity = self.severity.as_str().to_uppercase(),
            message = self.message,
            condition = self.kind.description(),
            status = self.status.as_str(),
            created = self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

/// Fans alerts out to every registered channel.
///
/// Channel failures are logged and never propagated; alerting must not
/// break the component that raised the alert.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Vec<Arc<dyn Channel>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) {
        tracing::info!(channel = channel.name(), "Registered alert channel");
        self.channels.push(channel);
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.add_channel(channel);
        self
    }

    /// Send to every channel, returning the per-channel status
    pub async fn notify(&self, alert: &Alert) -> Vec<DeliveryStatus> {
        let mut statuses = Vec::with_capacity(self.channels.len());

        for channel in &self.channels {
            match channel.send(alert).await {
                Ok(status) => {
                    if !status.success {
                        tracing::warn!(channel = channel.name(), status = %status, "Alert not delivered");
                    }
                    statuses.push(status);
                }
                Err(e) => {
                    tracing::error!(channel = channel.name(), error = %e, "Alert channel failed");
                    statuses.push(DeliveryStatus::failure(channel.name(), e.to_string()));
                }
            }
        }

        statuses
    }
}
