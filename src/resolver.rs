//! Cache-first resolution of a day's prayer times
//!
//! ```text
//!  fresh cache entry? ──yes──► serve
//!        │ no
//!        ▼
//!  TimeSourceClient::resolve ──ok──► cache (replace) ──► serve
//!        │ all sources exhausted
//!        ▼
//!  expired entry for the date / borrowed neighbour ──► serve, stale
//!        │ nothing
//!        ▼
//!  service-risk alert, NoScheduleAvailable
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::{CacheError, PrayerTimeCache};
use crate::health::HealthMonitor;
use crate::metrics;
use crate::models::{DailyPrayerTimes, Location};
use crate::scheduler::{SchedulerError, SchedulerResult};
use crate::source::TimeSourceClient;
use crate::storage::PutMode;

/// Times for a date and whether they are past their freshness TTL
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTimes {
    pub times: DailyPrayerTimes,
    pub stale: bool,
}

impl ResolvedTimes {
    pub fn fresh(times: DailyPrayerTimes) -> Self {
        Self { times, stale: false }
    }

    pub fn stale(times: DailyPrayerTimes) -> Self {
        Self { times, stale: true }
    }
}

/// Where the schedule computer gets prayer times from
#[async_trait]
pub trait TimesLookup: Send + Sync {
    /// Times for `date`, fetching upstream if needed
    async fn times_for(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<ResolvedTimes>;

    /// Times already held locally; never touches the network
    async fn cached(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<Option<ResolvedTimes>>;
}

fn storage_error(operation: &str, err: CacheError) -> SchedulerError {
    SchedulerError::storage(operation, err)
}

/// Offline lookup: the cache alone, expired entries served as stale
#[async_trait]
impl TimesLookup for PrayerTimeCache {
    async fn times_for(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<ResolvedTimes> {
        self.cached(date, now)
            .await?
            .ok_or_else(|| SchedulerError::no_schedule(date))
    }

    async fn cached(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<Option<ResolvedTimes>> {
        let entry = self
            .latest(date)
            .await
            .map_err(|e| storage_error("cache read", e))?;
        Ok(entry.map(|times| {
            let stale = times.is_expired_at(now);
            ResolvedTimes { times, stale }
        }))
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Cache, then sources, then stale fallback
pub struct TimesResolver {
    cache: Arc<PrayerTimeCache>,
    client: Arc<TimeSourceClient>,
    health: Arc<HealthMonitor>,
    location: Location,
    /// One upstream resolution at a time; waiters re-check the cache
    fetch_lock: Mutex<()>,
}

impl TimesResolver {
    pub fn new(
        cache: Arc<PrayerTimeCache>,
        client: Arc<TimeSourceClient>,
        health: Arc<HealthMonitor>,
        location: Location,
    ) -> Self {
        Self {
            cache,
            client,
            health,
            location,
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<PrayerTimeCache> {
        &self.cache
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    async fn fresh(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<Option<DailyPrayerTimes>> {
        self.cache
            .get_at(date, now)
            .await
            .map_err(|e| storage_error("cache read", e))
    }

    async fn stale_fallback(&self, date: NaiveDate) -> SchedulerResult<Option<DailyPrayerTimes>> {
        let config = self.cache.config();
        if !config.stale_fallback {
            return Ok(None);
        }

        if let Some(entry) = self
            .cache
            .latest(date)
            .await
            .map_err(|e| storage_error("cache read", e))?
        {
            return Ok(Some(entry));
        }

        let borrowed = self
            .cache
            .most_recent_before(date, config.stale_lookback_days)
            .await
            .map_err(|e| storage_error("cache read", e))?;
        if let Some(entry) = &borrowed {
            tracing::warn!(%date, borrowed_from = %entry.date, "Borrowing prayer times from an earlier day");
        }
        Ok(borrowed.map(|entry| entry.redated(date)))
    }
}

#[async_trait]
impl TimesLookup for TimesResolver {
    async fn times_for(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<ResolvedTimes> {
        if let Some(times) = self.fresh(date, now).await? {
            return Ok(ResolvedTimes::fresh(times));
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(times) = self.fresh(date, now).await? {
            return Ok(ResolvedTimes::fresh(times));
        }

        match self.client.resolve(date, &self.location).await {
            Ok(times) => {
                if let Err(e) = self.cache.put_at(times.clone(), PutMode::Replace, now).await {
                    tracing::warn!(%date, error = %e, "Failed to cache resolved prayer times");
                }
                self.health.clear_service_risk(date).await;
                Ok(ResolvedTimes::fresh(times))
            }
            Err(e) => {
                tracing::warn!(%date, error = %e, "Falling back to cached prayer times");
                // An expired entry is not valid data: the service is at risk either way
                self.health.raise_service_risk(date).await;

                match self.stale_fallback(date).await? {
                    Some(times) => {
                        metrics::record_stale_schedule();
                        tracing::warn!(%date, source = %times.source, expired_at = %times.expires_at, "Serving stale prayer times");
                        Ok(ResolvedTimes::stale(times))
                    }
                    None => Err(SchedulerError::no_schedule(date)),
                }
            }
        }
    }

    async fn cached(&self, date: NaiveDate, now: DateTime<Utc>) -> SchedulerResult<Option<ResolvedTimes>> {
        TimesLookup::cached(self.cache.as_ref(), date, now).await
    }
}
