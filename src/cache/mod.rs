//! TTL cache of resolved prayer times
//!
//! The cache is consulted before any network call. It keeps an in-memory
//! map in front of the durable [`PrayerTimesRepository`](crate::storage::PrayerTimesRepository):
//!
//! - `get` only returns fresh entries (`now < expires_at`)
//! - `put` refuses to overwrite an unexpired entry unless replacing
//! - `purge_expired` deletes expired rows and is safe to run repeatedly
//!
//! With stale fallback on, expired entries for yesterday and later stay in
//! the store and move to a stale shelf in memory, so the resolver can still
//! serve best-effort times when every source is down, across restarts too.
//!
//! # Example
//!
//! ```rust,ignore
//! use mawaqit::cache::PrayerTimeCache;
//! use mawaqit::storage::{PutMode, Repositories};
//!
//! let cache = PrayerTimeCache::new(Repositories::mock().prayer_times, config.cache.clone());
//! cache.put(times, PutMode::Insert).await?;
//! let cached = cache.get(date).await?;
//! ```

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::config::CacheConfig;
use crate::metrics;
use crate::models::DailyPrayerTimes;
use crate::storage::{PutMode, PutOutcome, SharedPrayerTimesRepository};

/// Errors raised by cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An unexpired entry already exists for the date
    #[error("unexpired prayer times for {date} already cached until {expires_at}")]
    Occupied {
        date: NaiveDate,
        expires_at: DateTime<Utc>,
    },

    #[error("cache storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    rejected_writes: AtomicU64,
    purge_runs: AtomicU64,
    entries_purged: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub purge_runs: u64,
    pub entries_purged: u64,
    /// Rows currently in the store
    pub entries: usize,
    /// Expired entries kept in memory for stale fallback
    pub stale_shelf: usize,
    pub hit_rate: f64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

pub struct PrayerTimeCache {
    repository: SharedPrayerTimesRepository,
    config: CacheConfig,
    memory: RwLock<BTreeMap<NaiveDate, DailyPrayerTimes>>,
    stale_shelf: RwLock<BTreeMap<NaiveDate, DailyPrayerTimes>>,
    counters: Counters,
}

impl PrayerTimeCache {
    pub fn new(repository: SharedPrayerTimesRepository, config: CacheConfig) -> Self {
        Self {
            repository,
            config,
            memory: RwLock::new(BTreeMap::new()),
            stale_shelf: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Load every stored entry into memory
    pub async fn warm(&self) -> CacheResult<usize> {
        let entries = self.repository.list()?;
        let count = entries.len();
        let mut memory = self.memory.write().await;
        for entry in entries {
            memory.insert(entry.date, entry);
        }
        metrics::set_cache_entries(count);
        Ok(count)
    }

    /// Fresh entry for a date
    pub async fn get(&self, date: NaiveDate) -> CacheResult<Option<DailyPrayerTimes>> {
        self.get_at(date, Utc::now()).await
    }

    pub async fn get_at(&self, date: NaiveDate, now: DateTime<Utc>) -> CacheResult<Option<DailyPrayerTimes>> {
        let fresh = self.lookup(date).await?.filter(|e| !e.is_expired_at(now));

        if fresh.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup(true);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup(false);
        }
        Ok(fresh)
    }

    /// Entry for a date regardless of freshness, including the stale shelf
    pub async fn latest(&self, date: NaiveDate) -> CacheResult<Option<DailyPrayerTimes>> {
        if let Some(entry) = self.lookup(date).await? {
            return Ok(Some(entry));
        }
        Ok(self.stale_shelf.read().await.get(&date).cloned())
    }

    /// Most recent entry dated within `days` before `date`
    pub async fn most_recent_before(
        &self,
        date: NaiveDate,
        days: u32,
    ) -> CacheResult<Option<DailyPrayerTimes>> {
        if days == 0 {
            return Ok(None);
        }
        let from = date - Duration::days(i64::from(days));
        let to = date - Duration::days(1);

        let stored = self.repository.most_recent_between(from, to)?;
        let shelved = self
            .stale_shelf
            .read()
            .await
            .range(from..=to)
            .next_back()
            .map(|(_, e)| e.clone());

        Ok(match (stored, shelved) {
            (Some(a), Some(b)) => Some(if a.date >= b.date { a } else { b }),
            (a, b) => a.or(b),
        })
    }

    async fn lookup(&self, date: NaiveDate) -> CacheResult<Option<DailyPrayerTimes>> {
        if let Some(entry) = self.memory.read().await.get(&date) {
            return Ok(Some(entry.clone()));
        }

        let stored = self.repository.get(date)?;
        if let Some(entry) = &stored {
            self.memory.write().await.insert(date, entry.clone());
        }
        Ok(stored)
    }

    pub async fn put(&self, entry: DailyPrayerTimes, mode: PutMode) -> CacheResult<PutOutcome> {
        self.put_at(entry, mode, Utc::now()).await
    }

    /// Upsert keyed by date; `PutMode::Insert` refuses an unexpired entry
    pub async fn put_at(
        &self,
        entry: DailyPrayerTimes,
        mode: PutMode,
        now: DateTime<Utc>,
    ) -> CacheResult<PutOutcome> {
        let outcome = self.repository.put(&entry, mode, now)?;

        if let PutOutcome::Rejected { existing_expires_at } = outcome {
            self.counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Occupied {
                date: entry.date,
                expires_at: existing_expires_at,
            });
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(date = %entry.date, source = %entry.source, ?outcome, "Cached prayer times");

        let date = entry.date;
        self.stale_shelf.write().await.remove(&date);
        self.memory.write().await.insert(date, entry);

        if self.config.max_entries > 0 {
            let dropped = self.repository.retain_newest(self.config.max_entries)?;
            if dropped > 0 {
                let mut memory = self.memory.write().await;
                while memory.len() > self.config.max_entries {
                    memory.pop_first();
                }
                tracing::debug!(dropped, "Trimmed oldest cached dates");
            }
        }

        metrics::set_cache_entries(self.repository.count()?);
        Ok(outcome)
    }

    pub async fn purge_expired(&self) -> CacheResult<usize> {
        self.purge_expired_at(Utc::now()).await
    }

    /// Delete expired entries. Dates not yet past move to the stale shelf
    /// and, with stale fallback on, stay in the store.
    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        // Dates before yesterday (UTC) can no longer anchor an event in any zone
        let keep_from = now.date_naive() - Duration::days(1);
        let removed = self
            .repository
            .delete_expired(now, self.config.stale_fallback.then_some(keep_from))?;
        {
            let mut memory = self.memory.write().await;
            let mut shelf = self.stale_shelf.write().await;
            let expired: Vec<NaiveDate> = memory
                .iter()
                .filter(|(_, e)| e.is_expired_at(now))
                .map(|(d, _)| *d)
                .collect();
            for date in expired {
                if let Some(entry) = memory.remove(&date) {
                    if self.config.stale_fallback && date >= keep_from {
                        shelf.insert(date, entry);
                    }
                }
            }
            shelf.retain(|date, _| *date >= keep_from);
        }

        self.counters.purge_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .entries_purged
            .fetch_add(removed as u64, Ordering::Relaxed);
        metrics::set_cache_entries(self.repository.count()?);

        if removed > 0 {
            tracing::info!(removed, "Purged expired prayer times");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        Ok(CacheStats {
            hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            rejected_writes: self.counters.rejected_writes.load(Ordering::Relaxed),
            purge_runs: self.counters.purge_runs.load(Ordering::Relaxed),
            entries_purged: self.counters.entries_purged.load(Ordering::Relaxed),
            entries: self.repository.count()?,
            stale_shelf: self.stale_shelf.read().await.len(),
            hit_rate: CacheStats::compute_hit_rate(hits, misses),
        })
    }

    /// Write every stored entry to a JSON file
    pub async fn export_snapshot(&self, path: &Path) -> CacheResult<usize> {
        let entries = self.repository.list()?;
        let json = serde_json::to_vec_pretty(&entries).context("Failed to encode cache snapshot")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write cache snapshot {}", path.display()))?;

        tracing::info!(path = %path.display(), entries = entries.len(), "Exported cache snapshot");
        Ok(entries.len())
    }

    /// Load unexpired entries from a snapshot without overwriting fresher ones
    pub async fn import_snapshot(&self, path: &Path) -> CacheResult<usize> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read cache snapshot {}", path.display()))?;
        let entries: Vec<DailyPrayerTimes> =
            serde_json::from_slice(&raw).context("Failed to decode cache snapshot")?;

        let now = Utc::now();
        let mut imported = 0;
        for entry in entries.into_iter().filter(|e| !e.is_expired_at(now)) {
            match self.put_at(entry, PutMode::Insert, now).await {
                Ok(_) => imported += 1,
                Err(CacheError::Occupied { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(path = %path.display(), imported, "Imported cache snapshot");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Prayer;
    use crate::storage::Repositories;
    use chrono::NaiveTime;

    fn entry(date: NaiveDate, fetched_at: DateTime<Utc>) -> DailyPrayerTimes {
        let times = [
            (Prayer::Fajr, (4, 58)),
            (Prayer::Sunrise, (6, 20)),
            (Prayer::Dhuhr, (12, 5)),
            (Prayer::Asr, (15, 30)),
            (Prayer::Maghrib, (17, 55)),
            (Prayer::Isha, (19, 15)),
        ]
        .into_iter()
        .map(|(p, (h, m))| (p, NaiveTime::from_hms_opt(h, m, 0).unwrap()))
        .collect();
        DailyPrayerTimes::new(date, times, "aladhan", fetched_at, Duration::hours(24))
    }

    fn caches() -> Vec<PrayerTimeCache> {
        let sqlite = Repositories::from_store(std::sync::Arc::new(
            crate::storage::SqliteRepository::in_memory().unwrap(),
        ));
        vec![
            PrayerTimeCache::new(Repositories::mock().prayer_times, CacheConfig::default()),
            PrayerTimeCache::new(sqlite.prayer_times, CacheConfig::default()),
        ]
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        date().and_hms_opt(hour, 0, 0).unwrap().and_utc()
    }

    #[tokio::test]
    async fn test_put_get_until_expiry_then_purge() {
        for cache in caches() {
            let fetched = at(1);
            let e = entry(date(), fetched);
            cache.put_at(e.clone(), PutMode::Insert, fetched).await.unwrap();

            assert_eq!(cache.get_at(date(), at(2)).await.unwrap(), Some(e.clone()));
            let expiry = e.expires_at;
            assert_eq!(cache.get_at(date(), expiry).await.unwrap(), None);

            // Still within the stale fallback window
            assert_eq!(cache.purge_expired_at(expiry).await.unwrap(), 0);

            let later = expiry + Duration::days(2);
            assert_eq!(cache.purge_expired_at(later).await.unwrap(), 1);
            assert_eq!(cache.purge_expired_at(later).await.unwrap(), 0);
            assert_eq!(cache.stats().await.unwrap().entries, 0);
        }
    }

    #[tokio::test]
    async fn test_insert_rejected_while_fresh() {
        for cache in caches() {
            let fetched = at(1);
            cache.put_at(entry(date(), fetched), PutMode::Insert, fetched).await.unwrap();

            let err = cache
                .put_at(entry(date(), at(2)), PutMode::Insert, at(2))
                .await
                .unwrap_err();
            assert!(matches!(err, CacheError::Occupied { .. }));

            let outcome = cache
                .put_at(entry(date(), at(2)), PutMode::Replace, at(2))
                .await
                .unwrap();
            assert_eq!(outcome, PutOutcome::Replaced);
            assert_eq!(cache.get_at(date(), at(3)).await.unwrap().unwrap().fetched_at, at(2));

            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.writes, 2);
            assert_eq!(stats.rejected_writes, 1);
        }
    }

    #[tokio::test]
    async fn test_latest_survives_purge_on_stale_shelf() {
        for cache in caches() {
            let fetched = at(1) - Duration::hours(23);
            cache.put_at(entry(date(), fetched), PutMode::Insert, fetched).await.unwrap();

            let now = at(3);
            assert!(cache.get_at(date(), now).await.unwrap().is_none());
            assert_eq!(cache.purge_expired_at(now).await.unwrap(), 0);

            let stale = cache.latest(date()).await.unwrap().unwrap();
            assert!(stale.is_expired_at(now));
            let stats = cache.stats().await.unwrap();
            assert_eq!(stats.stale_shelf, 1);
            assert_eq!(stats.entries, 1);

            // Two days later the shelf is cleared
            cache.purge_expired_at(now + Duration::days(2)).await.unwrap();
            assert!(cache.latest(date()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_stale_entry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let fetched = at(1) - Duration::hours(23);
        let now = at(3);

        {
            let repos = Repositories::sqlite(&path).unwrap();
            let cache = PrayerTimeCache::new(repos.prayer_times, CacheConfig::default());
            cache.put_at(entry(date(), fetched), PutMode::Insert, fetched).await.unwrap();
            cache.purge_expired_at(now).await.unwrap();
        }

        let repos = Repositories::sqlite(&path).unwrap();
        let cache = PrayerTimeCache::new(repos.prayer_times, CacheConfig::default());
        assert_eq!(cache.warm().await.unwrap(), 1);
        assert!(cache.get_at(date(), now).await.unwrap().is_none());
        assert_eq!(cache.latest(date()).await.unwrap().unwrap().fetched_at, fetched);
    }

    #[tokio::test]
    async fn test_purge_deletes_expired_without_stale_fallback() {
        let config = CacheConfig {
            stale_fallback: false,
            ..CacheConfig::default()
        };
        let cache = PrayerTimeCache::new(Repositories::mock().prayer_times, config);
        let fetched = at(1) - Duration::hours(23);
        cache.put_at(entry(date(), fetched), PutMode::Insert, fetched).await.unwrap();

        assert_eq!(cache.purge_expired_at(at(3)).await.unwrap(), 1);
        assert!(cache.latest(date()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_most_recent_before() {
        for cache in caches() {
            let now = at(1);
            let earlier = date() - Duration::days(2);
            cache.put_at(entry(earlier, now), PutMode::Insert, now).await.unwrap();

            assert!(cache.most_recent_before(date(), 0).await.unwrap().is_none());
            assert!(cache.most_recent_before(date(), 1).await.unwrap().is_none());
            assert_eq!(
                cache.most_recent_before(date(), 3).await.unwrap().unwrap().date,
                earlier
            );
        }
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_dates() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = PrayerTimeCache::new(Repositories::mock().prayer_times, config);
        let now = at(1);
        for d in 0..4 {
            cache
                .put_at(entry(date() + Duration::days(d), now), PutMode::Insert, now)
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().await.unwrap().entries, 2);
        assert!(cache.latest(date()).await.unwrap().is_none());
        assert!(cache.latest(date() + Duration::days(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = PrayerTimeCache::new(Repositories::mock().prayer_times, CacheConfig::default());
        let now = Utc::now();
        cache.put_at(entry(now.date_naive(), now), PutMode::Insert, now).await.unwrap();

        cache.get(now.date_naive()).await.unwrap();
        cache.get(now.date_naive()).await.unwrap();
        cache.get(now.date_naive() + Duration::days(5)).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots").join("cache.json");
        let now = Utc::now();

        let source = PrayerTimeCache::new(Repositories::mock().prayer_times, CacheConfig::default());
        source.put_at(entry(now.date_naive(), now), PutMode::Insert, now).await.unwrap();
        let old = now - Duration::days(3);
        source
            .put_at(entry(old.date_naive(), old), PutMode::Insert, old)
            .await
            .unwrap();
        assert_eq!(source.export_snapshot(&path).await.unwrap(), 2);

        let target = PrayerTimeCache::new(Repositories::mock().prayer_times, CacheConfig::default());
        assert_eq!(target.import_snapshot(&path).await.unwrap(), 1);
        assert!(target.get(now.date_naive()).await.unwrap().is_some());

        // Importing again does not overwrite the fresh entry
        assert_eq!(target.import_snapshot(&path).await.unwrap(), 0);
    }
}
