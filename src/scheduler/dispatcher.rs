//! Event dispatch loop
//!
//! One loop drives every group:
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │ pass(now)                                                  │
//!  │   for each active group (buffer_unordered, bounded)        │
//!  │     events in (now - max grace, now] sorted                │
//!  │       overdue beyond class grace ─► ledger: skipped        │
//!  │       ledger claim lost          ─► duplicate, skip        │
//!  │       deliver ─► ok / DispatchError ─► HealthMonitor       │
//!  │                      target gone  ─► group deactivated     │
//!  └───────────────┬────────────────────────────────────────────┘
//!                  ▼
//!   sleep until next instant (≤ max idle) or shutdown
//! ```
//!
//! Delivery is never retried: the ledger entry is claimed before the call,
//! so a failed delivery stays failed and the next occurrence goes out.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use super::schedule::{earliest, ScheduleComputer};
use super::SchedulerError;
use crate::config::SchedulerConfig;
use crate::error::ErrorCategory;
use crate::groups::{ActiveGroupsManager, GroupSchedulePolicy};
use crate::health::{ErrorSeverity, HealthEvent, HealthMonitor};
use crate::metrics;
use crate::models::{DedupKey, EventClass, ScheduledEvent};
use crate::notifications::{ChannelError, WebhookChannel, WebhookConfig};
use crate::resolver::TimesLookup;
use crate::storage::LedgerMark;

// ============================================================================
// Delivery Contract
// ============================================================================

/// Why a delivery did not go through
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The target no longer accepts messages (bot removed, chat deleted)
    #[error("target gone: {0}")]
    TargetGone(String),

    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_target_gone(&self) -> bool {
        matches!(self, Self::TargetGone(_))
    }
}

/// A failed delivery of one event occurrence
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dispatch of {key} failed: {cause}")]
pub struct DispatchError {
    pub key: DedupKey,
    pub cause: DeliveryError,
}

impl DispatchError {
    pub fn new(key: DedupKey, cause: DeliveryError) -> Self {
        Self { key, cause }
    }
}

/// Hands an event to the outside world
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &ScheduledEvent) -> Result<(), DeliveryError>;
}

/// Dry-run delivery that only logs
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ScheduledEvent) -> Result<(), DeliveryError> {
        tracing::info!(
            group = %event.group,
            class = %event.class,
            occurrence = %event.occurrence,
            local_time = %event.local_time,
            stale = event.stale,
            "Event due"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a delivery endpoint
pub struct WebhookDelivery {
    channel: WebhookChannel,
}

impl WebhookDelivery {
    /// Retries are disabled: a failed delivery is reported, not repeated
    pub fn new(config: WebhookConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            channel: WebhookChannel::new(config.with_max_retries(0))?,
        })
    }

    fn classify(error: ChannelError) -> DeliveryError {
        match error {
            ChannelError::Status { status, body } => match status {
                403 | 404 | 410 => DeliveryError::TargetGone(format!("HTTP {status}: {body}")),
                400..=499 => DeliveryError::Rejected(format!("HTTP {status}: {body}")),
                _ => DeliveryError::Transient(format!("HTTP {status}: {body}")),
            },
            ChannelError::InvalidConfig(msg) => DeliveryError::Rejected(msg),
            other => DeliveryError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDelivery {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &ScheduledEvent) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "dedup_key": event.dedup_key().to_string(),
            "event": event,
        });
        self.channel.post_json(&payload).await.map_err(Self::classify)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Lateness tolerated per event class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraceWindows {
    pub prayer: Duration,
    pub delayed: Duration,
    pub periodic: Duration,
}

impl Default for GraceWindows {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl GraceWindows {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            prayer: Duration::minutes(config.prayer_grace_minutes),
            delayed: Duration::minutes(config.delayed_grace_minutes),
            periodic: Duration::minutes(config.periodic_grace_minutes),
        }
    }

    pub fn for_class(&self, class: EventClass) -> Duration {
        match class {
            EventClass::PreAlert | EventClass::PrayerStart => self.prayer,
            EventClass::DelayedAction => self.delayed,
            EventClass::Periodic => self.periodic,
        }
    }

    /// How far back a pass looks for due events
    pub fn widest(&self) -> Duration {
        self.prayer.max(self.delayed).max(self.periodic)
    }
}

/// Counts of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub groups: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub overdue: usize,
    pub failed: usize,
    pub deactivated: usize,
    /// Earliest event still ahead
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl PassReport {
    fn merge(&mut self, other: PassReport) {
        self.delivered += other.delivered;
        self.duplicates += other.duplicates;
        self.overdue += other.overdue;
        self.failed += other.failed;
        self.deactivated += other.deactivated;
        self.next_fire_at = match (self.next_fire_at, other.next_fire_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

pub struct EventDispatcher {
    computer: ScheduleComputer,
    lookup: Arc<dyn TimesLookup>,
    groups: ActiveGroupsManager,
    health: Arc<HealthMonitor>,
    channel: Arc<dyn DeliveryChannel>,
    grace: GraceWindows,
    concurrency: usize,
    max_idle: Duration,
}

impl EventDispatcher {
    pub fn new(
        computer: ScheduleComputer,
        lookup: Arc<dyn TimesLookup>,
        groups: ActiveGroupsManager,
        health: Arc<HealthMonitor>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            computer,
            lookup,
            groups,
            health,
            channel,
            grace: GraceWindows::default(),
            concurrency: 8,
            max_idle: Duration::seconds(60),
        }
    }

    pub fn with_config(mut self, config: &SchedulerConfig) -> Self {
        self.grace = GraceWindows::from_config(config);
        self.concurrency = config.dispatch_concurrency.max(1);
        self.max_idle = Duration::seconds(config.max_idle_secs as i64);
        self
    }

    /// Dispatch everything due at `now` across all active groups
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let policies = match self.groups.active_policies() {
            Ok(policies) => policies,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load group policies");
                self.health
                    .record_error(ErrorCategory::Database, ErrorSeverity::High, e.to_string(), None)
                    .await;
                return PassReport::default();
            }
        };
        metrics::set_active_groups(policies.len());

        let mut report = PassReport {
            groups: policies.len(),
            ..Default::default()
        };

        let results: Vec<PassReport> = stream::iter(policies)
            .map(|policy| async move { self.dispatch_group(&policy, now).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for group_report in results {
            report.merge(group_report);
        }

        if report.delivered + report.failed + report.overdue > 0 {
            tracing::info!(
                delivered = report.delivered,
                duplicates = report.duplicates,
                overdue = report.overdue,
                failed = report.failed,
                deactivated = report.deactivated,
                "Dispatch pass complete"
            );
        }
        report
    }

    async fn events_for(&self, policy: &GroupSchedulePolicy, since: DateTime<Utc>) -> Option<Vec<ScheduledEvent>> {
        match self.computer.next_events(since, policy, self.lookup.as_ref()).await {
            Ok(events) => Some(events),
            Err(SchedulerError::NoScheduleAvailable { date }) => {
                tracing::warn!(group = %policy.group, %date, "No prayer times, remembrance only");
                self.computer.periodic_events(since, policy).ok()
            }
            Err(e) => {
                tracing::error!(group = %policy.group, error = %e, "Cannot compute schedule");
                self.health
                    .record_error(
                        ErrorCategory::Scheduling,
                        ErrorSeverity::High,
                        e.to_string(),
                        Some(&policy.group.to_string()),
                    )
                    .await;
                None
            }
        }
    }

    /// Events of one group, in order; stops at the first `TargetGone`
    async fn dispatch_group(&self, policy: &GroupSchedulePolicy, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let since = now - self.grace.widest();
        let Some(events) = self.events_for(policy, since).await else {
            return report;
        };

        let (due, upcoming): (Vec<_>, Vec<_>) = events.into_iter().partition(|e| e.is_due(now));
        report.next_fire_at = earliest(&upcoming).map(|e| e.fire_at);

        for event in due {
            let key = event.dedup_key();

            if event.lateness(now) > self.grace.for_class(event.class) {
                match self.groups.record_skipped(&key) {
                    // Delivered or skipped by an earlier pass
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Failed to record overdue event");
                    }
                }
                tracing::debug!(key = %key, "Skipping overdue event");
                metrics::record_dispatch(event.class.as_str(), "overdue");
                report.overdue += 1;
                continue;
            }

            match self.groups.claim(&key, LedgerMark::Dispatched) {
                Ok(true) => {}
                Ok(false) => {
                    metrics::record_dispatch(event.class.as_str(), "duplicate");
                    report.duplicates += 1;
                    continue;
                }
                Err(e) => {
                    // Unclaimed events are not sent; at-most-once wins over delivery
                    tracing::error!(key = %key, error = %e, "Ledger unavailable, event not sent");
                    self.health
                        .record_error(ErrorCategory::Database, ErrorSeverity::High, e.to_string(), None)
                        .await;
                    report.failed += 1;
                    continue;
                }
            }

            match self.channel.deliver(&event).await {
                Ok(()) => {
                    tracing::debug!(key = %key, channel = self.channel.name(), "Delivered event");
                    metrics::record_dispatch(event.class.as_str(), "delivered");
                    report.delivered += 1;
                }
                Err(cause) => {
                    let target_gone = cause.is_target_gone();
                    tracing::warn!(key = %key, error = %cause, "Delivery failed");
                    metrics::record_dispatch(event.class.as_str(), "failed");
                    self.health
                        .record(HealthEvent::Dispatch(DispatchError::new(key, cause)))
                        .await;
                    report.failed += 1;

                    if target_gone {
                        match self.groups.remove_group(policy.group) {
                            Ok(_) => {
                                tracing::warn!(group = %policy.group, "Group deactivated, target gone");
                                report.deactivated += 1;
                            }
                            Err(e) => tracing::error!(group = %policy.group, error = %e, "Failed to deactivate group"),
                        }
                        report.next_fire_at = None;
                        break;
                    }
                }
            }
        }

        report
    }

    /// Time to sleep after a pass
    pub fn idle_for(&self, report: &PassReport, now: DateTime<Utc>) -> std::time::Duration {
        let wait = report
            .next_fire_at
            .map(|at| (at - now).min(self.max_idle))
            .unwrap_or(self.max_idle)
            .max(Duration::zero());
        wait.to_std().unwrap_or_default()
    }

    /// Run passes until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            channel = self.channel.name(),
            concurrency = self.concurrency,
            "Event dispatcher started"
        );

        while !*shutdown.borrow() {
            let now = Utc::now();
            let report = self.run_pass(now).await;
            let idle = self.idle_for(&report, Utc::now());

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Event dispatcher stopped");
    }
}
