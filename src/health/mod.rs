//! Failure classification, circuit breaking and alerting
//!
//! The [`HealthMonitor`] is the single writer of source health. Every
//! external call reports its outcome here:
//!
//! ```text
//!  TimeSourceClient ──► Success / SourceError / InvalidTimes ─┐
//!  EventDispatcher  ──► DispatchError ─────────────────────────┤
//!  TimesResolver    ──► service risk ──────────────────────────┤
//!                                                              ▼
//!                                 ┌──────────────────────────────────────┐
//!                                 │ HealthMonitor                        │
//!                                 │  SourceHealth per source (circuit)   │
//!                                 │  ErrorLog ring                       │
//!                                 │  active alerts ──► Notifier channels │
//!                                 └──────────────┬───────────────────────┘
//!                                                ▼
//!                                   HealthRepository (write-through)
//! ```

pub mod circuit;
pub mod errors;

pub use circuit::{CircuitPolicy, CircuitState, SourceHealth, SourceStats};
pub use errors::{ErrorLog, ErrorRecord, ErrorSeverity, ErrorStatistics};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::error::ErrorCategory;
use crate::metrics;
use crate::notifications::{
    Alert, AlertKind, AlertSeverity, ChannelResult, Notifier, WebhookChannel,
};
use crate::scheduler::dispatcher::{DeliveryError, DispatchError};
use crate::source::{SourceError, SourceFailure};
use crate::storage::SharedHealthRepository;
use crate::validator::InvalidTimesError;

// ============================================================================
// Events
// ============================================================================

/// Outcome reported by a component after an external call
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Validated fetch from a source
    Success {
        source: String,
        latency: std::time::Duration,
    },
    /// Transport or payload failure of a source attempt
    Source(SourceError),
    /// Payload parsed but failed validation
    InvalidTimes {
        source: String,
        error: InvalidTimesError,
    },
    /// Delivery collaborator refused or failed an event
    Dispatch(DispatchError),
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    #[serde(flatten)]
    pub health: SourceHealth,
    pub status: SourceStatus,
    pub retry_at: Option<DateTime<Utc>>,
}

/// Read-only snapshot for operators
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub available_sources: usize,
    pub sources: Vec<SourceReport>,
    pub service_risk: Option<NaiveDate>,
    pub errors: ErrorStatistics,
    pub active_alerts: Vec<Alert>,
}

// ============================================================================
// Monitor
// ============================================================================

pub struct HealthMonitor {
    config: HealthConfig,
    policy: CircuitPolicy,
    sources: RwLock<BTreeMap<String, SourceHealth>>,
    errors: RwLock<ErrorLog>,
    /// Active alerts keyed by [`AlertKind::key`]
    alerts: RwLock<HashMap<String, Alert>>,
    service_risk: RwLock<Option<NaiveDate>>,
    repository: Option<SharedHealthRepository>,
    notifier: Notifier,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            policy: CircuitPolicy::from_config(&config),
            errors: RwLock::new(ErrorLog::new(config.max_error_records)),
            config,
            sources: RwLock::new(BTreeMap::new()),
            alerts: RwLock::new(HashMap::new()),
            service_risk: RwLock::new(None),
            repository: None,
            notifier: Notifier::new(),
            started_at: Utc::now(),
        }
    }

    /// Monitor with the configured alert webhook attached
    pub fn from_config(config: &HealthConfig) -> ChannelResult<Self> {
        let mut notifier = Notifier::new();
        if let Some(webhook) = &config.alert_webhook {
            notifier.add_channel(Arc::new(WebhookChannel::new(webhook.clone())?));
        }
        Ok(Self::new(config.clone()).with_notifier(notifier))
    }

    pub fn with_repository(mut self, repository: SharedHealthRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Load persisted source health; returns how many records were restored
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let restored = repository.load_source_health()?;
        let count = restored.len();

        let mut sources = self.sources.write().await;
        for health in restored {
            tracing::debug!(source = %health.source, circuit = health.circuit.as_str(), "Restored source health");
            sources.insert(health.source.clone(), health);
        }

        Ok(count)
    }

    /// Make a source known; keeps restored state, updates its priority
    pub async fn register_source(&self, name: &str, priority: u32) {
        let mut sources = self.sources.write().await;
        sources
            .entry(name.to_string())
            .and_modify(|h| h.priority = priority)
            .or_insert_with(|| SourceHealth::new(name, priority));
    }

    pub async fn record(&self, event: HealthEvent) {
        self.record_at(event, Utc::now()).await
    }

    pub async fn record_at(&self, event: HealthEvent, now: DateTime<Utc>) {
        match event {
            HealthEvent::Success { source, latency } => {
                let updated = self
                    .update_source(&source, now, |health| {
                        let was_closed = health.circuit == CircuitState::Closed;
                        health.record_success(now, latency);
                        if !was_closed {
                            tracing::info!(source = %health.source, "Circuit closed after successful probe");
                        }
                    })
                    .await;
                self.persist(&updated);
            }
            HealthEvent::Source(error) => {
                let transport = error.cause.is_transport();
                let reason = error.cause.to_string();
                let mut tripped = false;
                let updated = self
                    .update_source(&error.source, now, |health| {
                        tripped = if transport {
                            health.record_transport_failure(now, &reason, &self.policy)
                        } else {
                            health.record_quality_failure(now, &reason, &self.policy)
                        };
                    })
                    .await;
                self.on_source_failure(&updated, tripped);

                let category = match &error.cause {
                    SourceFailure::Timeout(_) | SourceFailure::Connect(_) => ErrorCategory::Network,
                    SourceFailure::Status(_) | SourceFailure::RateLimited => ErrorCategory::Api,
                    SourceFailure::Malformed(_) => ErrorCategory::Validation,
                };
                let severity = if tripped { ErrorSeverity::High } else { ErrorSeverity::Medium };
                self.push_error(
                    ErrorRecord::new(category, severity, error.to_string())
                        .with_subject(&error.source)
                        .at(now),
                )
                .await;
            }
            HealthEvent::InvalidTimes { source, error } => {
                let mut tripped = false;
                let updated = self
                    .update_source(&source, now, |health| {
                        tripped = health.record_quality_failure(now, &error.reason, &self.policy);
                    })
                    .await;
                self.on_source_failure(&updated, tripped);

                self.push_error(
                    ErrorRecord::new(ErrorCategory::Validation, ErrorSeverity::Medium, error.to_string())
                        .with_subject(&source)
                        .at(now),
                )
                .await;
            }
            HealthEvent::Dispatch(error) => {
                let severity = match error.cause {
                    DeliveryError::TargetGone(_) => ErrorSeverity::Low,
                    DeliveryError::Rejected(_) | DeliveryError::Transient(_) => ErrorSeverity::Medium,
                };
                self.push_error(
                    ErrorRecord::new(ErrorCategory::Delivery, severity, error.to_string())
                        .with_subject(error.key.group.to_string())
                        .at(now),
                )
                .await;
            }
        }
    }

    /// Record a failure that is not tied to a source attempt
    pub async fn record_error(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        subject: Option<&str>,
    ) {
        let mut record = ErrorRecord::new(category, severity, message);
        if let Some(subject) = subject {
            record = record.with_subject(subject);
        }
        self.push_error(record).await;
    }

    async fn update_source<F>(&self, name: &str, now: DateTime<Utc>, apply: F) -> SourceHealth
    where
        F: FnOnce(&mut SourceHealth),
    {
        let mut sources = self.sources.write().await;
        let health = sources
            .entry(name.to_string())
            .or_insert_with(|| SourceHealth::new(name, u32::MAX));
        apply(health);
        health.updated_at = now;
        metrics::set_circuit_state(&health.source, health.circuit);
        health.clone()
    }

    fn on_source_failure(&self, health: &SourceHealth, tripped: bool) {
        if tripped {
            tracing::warn!(
                source = %health.source,
                cooldown_secs = health.cooldown_secs,
                trips = health.trips,
                "Circuit opened"
            );
            metrics::record_circuit_trip(&health.source);
        }
        self.persist(health);
    }

    async fn push_error(&self, record: ErrorRecord) {
        metrics::record_error(record.category.as_str(), record.severity.as_str());
        self.errors.write().await.push(record);
    }

    fn persist(&self, health: &SourceHealth) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save_source_health(health) {
                tracing::warn!(source = %health.source, error = %e, "Failed to persist source health");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn is_open(&self, source: &str) -> bool {
        self.is_open_at(source, Utc::now()).await
    }

    pub async fn is_open_at(&self, source: &str, now: DateTime<Utc>) -> bool {
        self.sources
            .read()
            .await
            .get(source)
            .is_some_and(|h| h.is_open(now))
    }

    /// Gate a request; an OPEN circuit past its cooldown becomes HALF_OPEN
    pub async fn allow_request(&self, source: &str) -> bool {
        self.allow_request_at(source, Utc::now()).await
    }

    pub async fn allow_request_at(&self, source: &str, now: DateTime<Utc>) -> bool {
        let mut sources = self.sources.write().await;
        let Some(health) = sources.get_mut(source) else {
            return true;
        };

        let before = health.circuit;
        let allowed = health.allow_request(now);
        if before != health.circuit {
            tracing::info!(source = %source, "Circuit half-open, allowing probe");
            metrics::set_circuit_state(source, health.circuit);
            let snapshot = health.clone();
            drop(sources);
            self.persist(&snapshot);
        }
        allowed
    }

    pub async fn source_health(&self, source: &str) -> Option<SourceHealth> {
        self.sources.read().await.get(source).cloned()
    }

    pub async fn error_statistics(&self) -> ErrorStatistics {
        self.errors.read().await.statistics()
    }

    pub async fn unresolved_errors(&self) -> Vec<ErrorRecord> {
        self.errors.read().await.unresolved()
    }

    pub async fn critical_errors(&self, window: Duration) -> Vec<ErrorRecord> {
        self.errors.read().await.critical_within(Utc::now(), window)
    }

    pub async fn resolve_error(&self, id: Uuid, note: Option<String>) -> bool {
        self.errors.write().await.resolve(id, note)
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.read().await.values().cloned().collect();
        alerts.sort_by_key(|a| a.created_at);
        alerts
    }

    // ------------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------------

    /// No valid cache entry and no source answered for `date`
    pub async fn raise_service_risk(&self, date: NaiveDate) -> Option<Alert> {
        {
            let mut risk = self.service_risk.write().await;
            if *risk == Some(date) {
                return None;
            }
            *risk = Some(date);
        }
        self.record_error(
            ErrorCategory::Scheduling,
            ErrorSeverity::Critical,
            format!("No prayer times available for {date}"),
            None,
        )
        .await;
        self.raise_alert(
            AlertKind::ServiceRisk {
                date: date.to_string(),
            },
            AlertSeverity::Critical,
            format!("No cached prayer times and no reachable source for {date}"),
        )
        .await
    }

    /// Times for `date` became available again
    pub async fn clear_service_risk(&self, date: NaiveDate) {
        let mut risk = self.service_risk.write().await;
        if *risk == Some(date) {
            *risk = None;
        }
        drop(risk);

        let key = AlertKind::ServiceRisk {
            date: date.to_string(),
        }
        .key();
        self.resolve_alert(&key).await;
    }

    /// Raise alerts for sources open too long and resolve cleared ones.
    /// Returns newly raised alerts.
    pub async fn evaluate_alerts_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let threshold = Duration::seconds(self.config.open_alert_after_secs);
        let (overdue, closed): (Vec<_>, Vec<_>) = {
            let sources = self.sources.read().await;
            let overdue = sources
                .values()
                .filter_map(|h| {
                    h.open_for(now)
                        .filter(|open| *open >= threshold)
                        .map(|open| (h.source.clone(), open))
                })
                .collect();
            let closed = sources
                .values()
                .filter(|h| h.circuit == CircuitState::Closed)
                .map(|h| h.source.clone())
                .collect();
            (overdue, closed)
        };

        let mut raised = Vec::new();
        for (source, open) in overdue {
            let message = format!(
                "Source '{source}' unavailable for {}",
                crate::utils::format_duration(open)
            );
            let kind = AlertKind::SourceOpenTooLong {
                source,
                open_secs: open.num_seconds(),
            };
            if let Some(alert) = self.raise_alert(kind, AlertSeverity::Warning, message).await {
                raised.push(alert);
            }
        }

        for source in closed {
            let key = AlertKind::SourceOpenTooLong {
                source,
                open_secs: 0,
            }
            .key();
            self.resolve_alert(&key).await;
        }

        raised
    }

    /// Raise an alert unless one with the same key is already active
    async fn raise_alert(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
    ) -> Option<Alert> {
        let key = kind.key();
        let alert = {
            let mut alerts = self.alerts.write().await;
            if alerts.contains_key(&key) {
                return None;
            }
            let mut alert = Alert::new(kind, severity, message).with_metadata("key", key.clone());
            alert.trigger();
            alerts.insert(key, alert.clone());
            alert
        };

        tracing::warn!(alert = %alert.kind.key(), severity = alert.severity.as_str(), "{}", alert.message);
        metrics::record_alert(alert.severity.as_str());
        self.save_alert(&alert);

        for status in self.notifier.notify(&alert).await {
            if !status.success {
                tracing::warn!(alert = %alert.id, %status, "Alert delivery failed");
            }
        }

        Some(alert)
    }

    async fn resolve_alert(&self, key: &str) {
        let resolved = self.alerts.write().await.remove(key);
        if let Some(mut alert) = resolved {
            alert.resolve();
            tracing::info!(alert = %key, "Alert resolved");
            self.save_alert(&alert);
        }
    }

    fn save_alert(&self, alert: &Alert) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save_alert(alert) {
                tracing::warn!(alert = %alert.id, error = %e, "Failed to persist alert");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    pub async fn snapshot(&self) -> HealthReport {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> HealthReport {
        let sources: Vec<SourceReport> = {
            let sources = self.sources.read().await;
            let mut reports: Vec<SourceReport> = sources
                .values()
                .map(|h| {
                    let status = if h.is_open(now) {
                        SourceStatus::Unavailable
                    } else if h.is_healthy(self.config.healthy_success_rate) {
                        SourceStatus::Healthy
                    } else {
                        SourceStatus::Degraded
                    };
                    SourceReport {
                        health: h.clone(),
                        status,
                        retry_at: h.retry_at(),
                    }
                })
                .collect();
            reports.sort_by_key(|r| (r.health.priority, r.health.source.clone()));
            reports
        };

        let available_sources = sources
            .iter()
            .filter(|r| r.status != SourceStatus::Unavailable)
            .count();
        let service_risk = *self.service_risk.read().await;

        let status = if available_sources == 0 || service_risk.is_some() {
            OverallStatus::Critical
        } else if sources.iter().any(|r| r.status != SourceStatus::Healthy) {
            OverallStatus::Warning
        } else {
            OverallStatus::Healthy
        };

        HealthReport {
            status,
            generated_at: now,
            uptime_secs: (now - self.started_at).num_seconds(),
            available_sources,
            sources,
            service_risk,
            errors: self.error_statistics().await,
            active_alerts: self.active_alerts().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DedupKey, EventClass, GroupId, OccurrenceKey, Prayer};
    use crate::storage::{HealthRepository, MockRepository};

    fn transport_failure(source: &str) -> HealthEvent {
        HealthEvent::Source(SourceError::new(source, SourceFailure::Status(503)))
    }

    fn success(source: &str) -> HealthEvent {
        HealthEvent::Success {
            source: source.to_string(),
            latency: std::time::Duration::from_millis(80),
        }
    }

    async fn monitor_with(sources: &[&str]) -> HealthMonitor {
        let monitor = HealthMonitor::new(HealthConfig::default());
        for (i, name) in sources.iter().enumerate() {
            monitor.register_source(name, i as u32 + 1).await;
        }
        monitor
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers() {
        let monitor = monitor_with(&["aladhan"]).await;
        let now = Utc::now();

        for _ in 0..3 {
            monitor.record_at(transport_failure("aladhan"), now).await;
        }
        assert!(monitor.is_open_at("aladhan", now).await);
        assert!(!monitor.allow_request_at("aladhan", now).await);

        let after_cooldown = now + Duration::seconds(301);
        assert!(monitor.allow_request_at("aladhan", after_cooldown).await);
        monitor.record_at(success("aladhan"), after_cooldown).await;
        assert!(!monitor.is_open_at("aladhan", after_cooldown).await);

        let health = monitor.source_health("aladhan").await.unwrap();
        assert_eq!(health.circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_source_is_allowed() {
        let monitor = monitor_with(&[]).await;
        assert!(monitor.allow_request("nowhere").await);
        assert!(!monitor.is_open("nowhere").await);
    }

    #[tokio::test]
    async fn test_errors_classified() {
        let monitor = monitor_with(&["aladhan"]).await;
        monitor
            .record(HealthEvent::Source(SourceError::new(
                "aladhan",
                SourceFailure::Timeout(std::time::Duration::from_secs(30)),
            )))
            .await;
        monitor
            .record(HealthEvent::Dispatch(DispatchError::new(
                DedupKey::new(
                    GroupId(7),
                    EventClass::PrayerStart,
                    OccurrenceKey::prayer(Prayer::Asr, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()),
                ),
                DeliveryError::Transient("503".to_string()),
            )))
            .await;

        let stats = monitor.error_statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_category["network"], 1);
        assert_eq!(stats.by_category["delivery"], 1);
    }

    #[tokio::test]
    async fn test_open_too_long_alert_deduplicated_and_resolved() {
        let repo = Arc::new(MockRepository::new());
        let monitor = HealthMonitor::new(HealthConfig::default())
            .with_repository(repo.clone() as SharedHealthRepository);
        monitor.register_source("aladhan", 1).await;

        let now = Utc::now();
        for _ in 0..3 {
            monitor.record_at(transport_failure("aladhan"), now).await;
        }

        assert!(monitor.evaluate_alerts_at(now + Duration::minutes(10)).await.is_empty());

        let late = now + Duration::minutes(31);
        let raised = monitor.evaluate_alerts_at(late).await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Warning);
        assert!(monitor.evaluate_alerts_at(late + Duration::minutes(1)).await.is_empty());
        assert_eq!(monitor.active_alerts().await.len(), 1);

        monitor.record_at(success("aladhan"), late).await;
        monitor.evaluate_alerts_at(late).await;
        assert!(monitor.active_alerts().await.is_empty());

        let stored = repo.recent_alerts(10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].is_open());
    }

    #[tokio::test]
    async fn test_service_risk_alert() {
        let monitor = monitor_with(&["aladhan"]).await;
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

        let alert = monitor.raise_service_risk(date).await.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert!(monitor.raise_service_risk(date).await.is_none());
        assert_eq!(monitor.snapshot().await.status, OverallStatus::Critical);

        monitor.clear_service_risk(date).await;
        assert!(monitor.active_alerts().await.is_empty());
        assert_eq!(monitor.snapshot().await.status, OverallStatus::Healthy);
    }

    #[tokio::test]
    async fn test_critical_errors_can_be_resolved() {
        let monitor = monitor_with(&["aladhan"]).await;
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

        let alert = monitor.raise_service_risk(date).await.unwrap();
        assert_eq!(alert.metadata["key"], "service_risk:2025-03-10");

        let critical = monitor.critical_errors(Duration::hours(24)).await;
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].category, ErrorCategory::Scheduling);
        assert_eq!(monitor.unresolved_errors().await.len(), 1);

        let id = critical[0].id;
        assert!(monitor.resolve_error(id, Some("cache refilled".into())).await);
        assert!(!monitor.resolve_error(id, None).await);
        assert!(monitor.unresolved_errors().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_status() {
        let monitor = monitor_with(&["aladhan", "prayzone"]).await;
        let now = Utc::now();
        assert_eq!(monitor.snapshot_at(now).await.status, OverallStatus::Healthy);

        for _ in 0..3 {
            monitor.record_at(transport_failure("aladhan"), now).await;
        }
        let report = monitor.snapshot_at(now).await;
        assert_eq!(report.status, OverallStatus::Warning);
        assert_eq!(report.available_sources, 1);
        assert_eq!(report.sources[0].status, SourceStatus::Unavailable);
        assert!(report.sources[0].retry_at.is_some());

        for _ in 0..3 {
            monitor.record_at(transport_failure("prayzone"), now).await;
        }
        assert_eq!(monitor.snapshot_at(now).await.status, OverallStatus::Critical);

        let json = serde_json::to_value(monitor.snapshot_at(now).await).unwrap();
        assert_eq!(json["status"], "critical");
        assert_eq!(json["sources"][0]["circuit"], "open");
    }

    #[tokio::test]
    async fn test_restore_from_repository() {
        let repo = Arc::new(MockRepository::new());
        let policy = CircuitPolicy::default();
        let mut saved = SourceHealth::new("aladhan", 1);
        for _ in 0..3 {
            saved.record_transport_failure(Utc::now(), "timeout", &policy);
        }
        repo.save_source_health(&saved).unwrap();

        let monitor = HealthMonitor::new(HealthConfig::default())
            .with_repository(repo as SharedHealthRepository);
        assert_eq!(monitor.restore().await.unwrap(), 1);
        monitor.register_source("aladhan", 4).await;

        let health = monitor.source_health("aladhan").await.unwrap();
        assert_eq!(health.circuit, CircuitState::Open);
        assert_eq!(health.priority, 4);
        assert!(monitor.is_open("aladhan").await);
    }
}
