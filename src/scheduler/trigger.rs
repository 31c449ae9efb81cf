//! Periodic maintenance tasks
//!
//! Independent `tokio::time::interval` loops keep the subsystem tidy:
//!
//! | Task         | Default interval | Work                                      |
//! |--------------|------------------|-------------------------------------------|
//! | purge        | 1h               | delete expired cache entries              |
//! | health check | 5m               | raise/resolve source-open alerts          |
//! | prefetch     | 6h               | resolve today and tomorrow ahead of need  |
//! | ledger prune | 1h               | drop dedup rows past retention            |
//!
//! Outcomes are broadcast as [`TriggerEvent`]s; a failing task logs and
//! waits for its next tick.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::{SchedulerError, SchedulerResult};
use crate::cache::PrayerTimeCache;
use crate::config::Config;
use crate::groups::ActiveGroupsManager;
use crate::health::HealthMonitor;
use crate::metrics;
use crate::resolver::TimesLookup;
use crate::utils::parse_timezone;

// ============================================================================
// Trigger Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub purge_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub prefetch_interval_secs: u64,
    pub ledger_prune_interval_secs: u64,
    /// Ledger rows older than this many days are dropped
    pub ledger_retention_days: i64,
    /// Timezone whose civil dates are prefetched
    pub timezone: String,
    /// Run every task once before the first interval elapses
    pub run_on_startup: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 3600,
            health_check_interval_secs: 300,
            prefetch_interval_secs: 6 * 3600,
            ledger_prune_interval_secs: 3600,
            ledger_retention_days: 7,
            timezone: "Africa/Cairo".to_string(),
            run_on_startup: true,
        }
    }
}

impl TriggerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            purge_interval_secs: config.cache.purge_interval_secs,
            health_check_interval_secs: config.health.check_interval_secs,
            prefetch_interval_secs: config.scheduler.prefetch_interval_secs,
            ledger_retention_days: config.scheduler.ledger_retention_days,
            timezone: config.scheduler.default_timezone.clone(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        for (field, secs) in [
            ("purge_interval_secs", self.purge_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("prefetch_interval_secs", self.prefetch_interval_secs),
            ("ledger_prune_interval_secs", self.ledger_prune_interval_secs),
        ] {
            if secs == 0 {
                return Err(SchedulerError::trigger_config(field, "interval must be greater than 0"));
            }
        }

        if self.ledger_retention_days < 1 {
            return Err(SchedulerError::trigger_config(
                "ledger_retention_days",
                "retention must be at least one day",
            ));
        }

        self.tz()?;
        Ok(())
    }

    fn tz(&self) -> SchedulerResult<Tz> {
        parse_timezone(&self.timezone).ok_or_else(|| SchedulerError::invalid_timezone(&self.timezone))
    }
}

// ============================================================================
// Tasks and Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    Purge,
    HealthCheck,
    Prefetch,
    LedgerPrune,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        MaintenanceTask::Purge,
        MaintenanceTask::HealthCheck,
        MaintenanceTask::Prefetch,
        MaintenanceTask::LedgerPrune,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purge => "purge",
            Self::HealthCheck => "health_check",
            Self::Prefetch => "prefetch",
            Self::LedgerPrune => "ledger_prune",
        }
    }

    fn interval_secs(&self, config: &TriggerConfig) -> u64 {
        match self {
            Self::Purge => config.purge_interval_secs,
            Self::HealthCheck => config.health_check_interval_secs,
            Self::Prefetch => config.prefetch_interval_secs,
            Self::LedgerPrune => config.ledger_prune_interval_secs,
        }
    }
}

/// Events emitted by the maintenance loops
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    Purged {
        removed: usize,
        at: DateTime<Utc>,
    },
    AlertsEvaluated {
        raised: usize,
        active: usize,
    },
    Prefetched {
        date: NaiveDate,
        stale: bool,
    },
    LedgerPruned {
        removed: usize,
        before: DateTime<Utc>,
    },
    TaskFailed {
        task: MaintenanceTask,
        reason: String,
    },
}

// ============================================================================
// Maintenance Trigger
// ============================================================================

pub struct MaintenanceTrigger {
    config: TriggerConfig,
    tz: Tz,
    cache: Arc<PrayerTimeCache>,
    lookup: Arc<dyn TimesLookup>,
    health: Arc<HealthMonitor>,
    groups: ActiveGroupsManager,
    event_sender: broadcast::Sender<TriggerEvent>,
}

impl MaintenanceTrigger {
    pub fn new(
        config: TriggerConfig,
        cache: Arc<PrayerTimeCache>,
        lookup: Arc<dyn TimesLookup>,
        health: Arc<HealthMonitor>,
        groups: ActiveGroupsManager,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let tz = config.tz()?;
        let (event_sender, _) = broadcast::channel(100);

        Ok(Self {
            config,
            tz,
            cache,
            lookup,
            health,
            groups,
            event_sender,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: TriggerEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    /// Run one task now and broadcast its outcome
    pub async fn run_task(&self, task: MaintenanceTask, now: DateTime<Utc>) -> SchedulerResult<Vec<TriggerEvent>> {
        let _timer = metrics::start_task_timer(task.as_str());
        let result = match task {
            MaintenanceTask::Purge => self.purge(now).await,
            MaintenanceTask::HealthCheck => self.check_health(now).await,
            MaintenanceTask::Prefetch => self.prefetch(now).await,
            MaintenanceTask::LedgerPrune => self.prune_ledger(now),
        };

        match result {
            Ok(events) => {
                for event in &events {
                    self.emit(event.clone());
                }
                Ok(events)
            }
            Err(e) => {
                tracing::warn!(task = task.as_str(), error = %e, "Maintenance task failed");
                self.emit(TriggerEvent::TaskFailed {
                    task,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn purge(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TriggerEvent>> {
        let removed = self
            .cache
            .purge_expired_at(now)
            .await
            .map_err(|e| SchedulerError::storage("cache purge", e))?;
        Ok(vec![TriggerEvent::Purged { removed, at: now }])
    }

    async fn check_health(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TriggerEvent>> {
        let raised = self.health.evaluate_alerts_at(now).await.len();
        let active = self.health.active_alerts().await.len();
        Ok(vec![TriggerEvent::AlertsEvaluated { raised, active }])
    }

    async fn prefetch(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TriggerEvent>> {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut events = Vec::new();
        let mut failures = Vec::new();

        for date in [today, today + Duration::days(1)] {
            match self.lookup.times_for(date, now).await {
                Ok(resolved) => {
                    tracing::debug!(%date, stale = resolved.stale, "Prefetched prayer times");
                    events.push(TriggerEvent::Prefetched {
                        date,
                        stale: resolved.stale,
                    });
                }
                Err(e) => failures.push(format!("{date}: {e}")),
            }
        }

        if events.is_empty() {
            return Err(SchedulerError::TriggerExecutionFailed {
                reason: failures.join("; "),
            });
        }
        for failure in failures {
            tracing::warn!(%failure, "Prefetch incomplete");
        }
        Ok(events)
    }

    fn prune_ledger(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TriggerEvent>> {
        let before = now - Duration::days(self.config.ledger_retention_days);
        let removed = self
            .groups
            .prune_ledger(before)
            .map_err(|e| SchedulerError::storage("ledger prune", e))?;
        if removed > 0 {
            tracing::info!(removed, %before, "Pruned dispatch ledger");
        }
        Ok(vec![TriggerEvent::LedgerPruned { removed, before }])
    }

    /// Start one loop per task; each stops when `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        MaintenanceTask::ALL
            .into_iter()
            .map(|task| {
                let trigger = Arc::clone(&self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let period = std::time::Duration::from_secs(task.interval_secs(&trigger.config));
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    if !trigger.config.run_on_startup {
                        ticker.tick().await;
                    }

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                let _ = trigger.run_task(task, Utc::now()).await;
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    tracing::debug!(task = task.as_str(), "Maintenance loop stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, HealthConfig};
    use crate::models::{DailyPrayerTimes, EventClass, GroupId, OccurrenceKey, Prayer};
    use crate::storage::{PutMode, Repositories};
    use chrono::NaiveTime;

    struct Fixture {
        trigger: MaintenanceTrigger,
        cache: Arc<PrayerTimeCache>,
        groups: ActiveGroupsManager,
    }

    fn fixture() -> Fixture {
        let repos = Repositories::mock();
        let cache = Arc::new(PrayerTimeCache::new(repos.prayer_times.clone(), CacheConfig::default()));
        let groups = ActiveGroupsManager::new(repos.groups.clone(), repos.ledger.clone());
        let trigger = MaintenanceTrigger::new(
            TriggerConfig::default(),
            cache.clone(),
            cache.clone(),
            Arc::new(HealthMonitor::new(HealthConfig::default())),
            groups.clone(),
        )
        .unwrap();
        Fixture { trigger, cache, groups }
    }

    fn entry(date: NaiveDate, fetched_at: DateTime<Utc>) -> DailyPrayerTimes {
        let times = [
            (Prayer::Fajr, (4, 58)),
            (Prayer::Dhuhr, (12, 5)),
            (Prayer::Asr, (15, 30)),
            (Prayer::Maghrib, (17, 55)),
            (Prayer::Isha, (19, 15)),
        ]
        .into_iter()
        .map(|(p, (h, m))| (p, NaiveTime::from_hms_opt(h, m, 0).unwrap()))
        .collect();
        DailyPrayerTimes::new(date, times, "test", fetched_at, Duration::hours(24))
    }

    #[test]
    fn test_config_validation() {
        assert!(TriggerConfig::default().validate().is_ok());

        let zero = TriggerConfig {
            purge_interval_secs: 0,
            ..TriggerConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(SchedulerError::TriggerConfigError { field, .. }) if field == "purge_interval_secs"
        ));

        let bad_tz = TriggerConfig {
            timezone: "Nowhere/Land".to_string(),
            ..TriggerConfig::default()
        };
        assert!(bad_tz.validate().is_err());
    }

    #[tokio::test]
    async fn test_purge_task_broadcasts() {
        let f = fixture();
        let mut events = f.trigger.subscribe();
        let now = Utc::now();
        // Older than the stale fallback window
        let old = now - Duration::days(4);
        f.cache
            .put_at(entry(old.date_naive(), old), PutMode::Insert, old)
            .await
            .unwrap();

        f.trigger.run_task(MaintenanceTask::Purge, now).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TriggerEvent::Purged { removed: 1, at: now }
        );

        // Idempotent
        let again = f.trigger.run_task(MaintenanceTask::Purge, now).await.unwrap();
        assert_eq!(again, vec![TriggerEvent::Purged { removed: 0, at: now }]);
    }

    #[tokio::test]
    async fn test_prefetch_reports_failure_without_data() {
        let f = fixture();
        let mut events = f.trigger.subscribe();

        let err = f
            .trigger
            .run_task(MaintenanceTask::Prefetch, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            events.recv().await.unwrap(),
            TriggerEvent::TaskFailed {
                task: MaintenanceTask::Prefetch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_prefetch_with_cached_today() {
        let f = fixture();
        let now = Utc::now();
        let tz: Tz = "Africa/Cairo".parse().unwrap();
        let today = now.with_timezone(&tz).date_naive();
        f.cache.put_at(entry(today, now), PutMode::Insert, now).await.unwrap();

        let events = f.trigger.run_task(MaintenanceTask::Prefetch, now).await.unwrap();
        assert_eq!(
            events,
            vec![TriggerEvent::Prefetched {
                date: today,
                stale: false
            }]
        );
    }

    #[tokio::test]
    async fn test_ledger_prune() {
        let f = fixture();
        let group = GroupId(1);
        let occurrence = OccurrenceKey::prayer(Prayer::Fajr, Utc::now().date_naive());
        assert!(f
            .groups
            .record_dispatched(group, EventClass::PrayerStart, &occurrence)
            .unwrap());

        let events = f
            .trigger
            .run_task(MaintenanceTask::LedgerPrune, Utc::now() + Duration::days(8))
            .await
            .unwrap();
        assert!(matches!(events[0], TriggerEvent::LedgerPruned { removed: 1, .. }));
        assert!(!f
            .groups
            .already_dispatched(group, EventClass::PrayerStart, &occurrence)
            .unwrap());
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handles = Arc::new(f.trigger).spawn(rx);
        assert_eq!(handles.len(), 4);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
