//! Repository Pattern for the persistent store
//!
//! The core never talks to a database directly. It issues keyed
//! upsert/select/delete operations through the traits below, so the storage
//! engine stays an external collaborator and tests can swap in memory maps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │      cache / groups / health / dispatcher                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Repository Traits                         │
//! │  PrayerTimesRepository, GroupPolicyRepository,              │
//! │  DispatchLedger, HealthRepository                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!      ┌─────────────────┐           ┌─────────────────┐
//!      │     SQLite      │           │      Mock       │
//!      │  Implementation │           │ Implementation  │
//!      └─────────────────┘           └─────────────────┘
//! ```
//!
//! Every write is single-row and atomic per key: one prayer-times row per
//! date, one health row per source, one ledger row per dedup key.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mawaqit::storage::repository::Repositories;
//!
//! // Production: use SQLite
//! let repos = Repositories::sqlite("data/mawaqit.db")?;
//!
//! // Testing: use Mock
//! let repos = Repositories::mock();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::groups::{EventToggles, GroupSchedulePolicy};
use crate::health::circuit::SourceHealth;
use crate::models::{DailyPrayerTimes, DedupKey, EventClass, GroupId, OccurrenceKey};
use crate::notifications::Alert;

// ============================================================================
// Core Types
// ============================================================================

/// How a prayer-times write treats an existing row for the same date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Reject if an unexpired entry already exists
    Insert,
    /// Supersede whatever is stored
    Replace,
}

/// Result of a prayer-times write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// An expired or explicitly replaced entry was superseded
    Replaced,
    /// An unexpired entry exists and the mode was [`PutMode::Insert`]
    Rejected { existing_expires_at: DateTime<Utc> },
}

/// What the dispatcher did with an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMark {
    /// Handed to the delivery collaborator
    Dispatched,
    /// Found past its grace window and dropped
    Skipped,
}

impl LedgerMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for LedgerMark {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "skipped" => LedgerMark::Skipped,
            _ => LedgerMark::Dispatched,
        })
    }
}

/// One dedup ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub key: DedupKey,
    pub mark: LedgerMark,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Durable store of resolved prayer times, one row per civil date
pub trait PrayerTimesRepository: Send + Sync {
    /// Get the entry for a date regardless of freshness
    fn get(&self, date: NaiveDate) -> Result<Option<DailyPrayerTimes>>;

    /// Atomic check-and-write keyed by `entry.date`
    fn put(
        &self,
        entry: &DailyPrayerTimes,
        mode: PutMode,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome>;

    /// Delete entries with `expires_at <= now`, returning how many.
    /// Entries dated on or after `keep_from` are kept even when expired.
    fn delete_expired(&self, now: DateTime<Utc>, keep_from: Option<NaiveDate>) -> Result<usize>;

    /// Most recent entry whose date lies in `[from, to]`
    fn most_recent_between(&self, from: NaiveDate, to: NaiveDate)
        -> Result<Option<DailyPrayerTimes>>;

    /// All entries ordered by date
    fn list(&self) -> Result<Vec<DailyPrayerTimes>>;

    /// Keep only the newest `max_entries` dates, returning how many were dropped
    fn retain_newest(&self, max_entries: usize) -> Result<usize>;

    fn count(&self) -> Result<usize>;
}

/// Per-group schedule configuration
pub trait GroupPolicyRepository: Send + Sync {
    fn upsert_policy(&self, policy: &GroupSchedulePolicy) -> Result<()>;

    fn get_policy(&self, group: GroupId) -> Result<Option<GroupSchedulePolicy>>;

    /// List policies ordered by group id
    fn list_policies(&self, active_only: bool) -> Result<Vec<GroupSchedulePolicy>>;

    /// Flip the active flag, returning false if the group is unknown
    fn set_active(&self, group: GroupId, active: bool, at: DateTime<Utc>) -> Result<bool>;
}

/// At-most-once ledger keyed by (group, event class, occurrence)
pub trait DispatchLedger: Send + Sync {
    /// Record the key if absent. Returns true only for the first recorder.
    fn try_record(&self, key: &DedupKey, mark: LedgerMark, at: DateTime<Utc>) -> Result<bool>;

    fn contains(&self, key: &DedupKey) -> Result<bool>;

    /// Latest ledger row for a group
    fn last_for_group(&self, group: GroupId) -> Result<Option<LedgerEntry>>;

    /// Drop rows recorded before `before`
    fn prune_before(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Source health and alert records for operational tooling
pub trait HealthRepository: Send + Sync {
    /// Upsert keyed by source name, last write wins
    fn save_source_health(&self, health: &SourceHealth) -> Result<()>;

    fn load_source_health(&self) -> Result<Vec<SourceHealth>>;

    /// Upsert keyed by alert id
    fn save_alert(&self, alert: &Alert) -> Result<()>;

    /// Newest first
    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite-backed implementation of every repository trait
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // WAL lets health probes read while the dispatcher writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS prayer_times (
                    date TEXT PRIMARY KEY,
                    times TEXT NOT NULL,
                    source TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    expires_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_prayer_times_expires
                    ON prayer_times(expires_ms);

                CREATE TABLE IF NOT EXISTS group_policies (
                    group_id INTEGER PRIMARY KEY,
                    title TEXT,
                    timezone TEXT NOT NULL,
                    lead_minutes INTEGER NOT NULL,
                    offset_minutes INTEGER NOT NULL,
                    pre_alert INTEGER NOT NULL,
                    prayer_start INTEGER NOT NULL,
                    delayed_action INTEGER NOT NULL,
                    periodic INTEGER NOT NULL,
                    periodic_interval_minutes INTEGER,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dispatch_ledger (
                    group_id INTEGER NOT NULL,
                    class TEXT NOT NULL,
                    occurrence TEXT NOT NULL,
                    mark TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    recorded_ms INTEGER NOT NULL,
                    PRIMARY KEY (group_id, class, occurrence)
                );

                CREATE INDEX IF NOT EXISTS idx_dispatch_ledger_recorded
                    ON dispatch_ledger(recorded_ms);

                CREATE TABLE IF NOT EXISTS source_health (
                    source TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS alerts (
                    id TEXT PRIMARY KEY,
                    severity TEXT NOT NULL,
                    status TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_ms INTEGER NOT NULL
                );
                "#,
        )
        .context("Failed to create SQLite schema")?;

        Ok(())
    }

    fn row_to_times(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn decode_times(raw: (String, String, String, String, String)) -> Result<DailyPrayerTimes> {
        let (date, times, source, fetched_at, expires_at) = raw;
        Ok(DailyPrayerTimes {
            date: date
                .parse()
                .with_context(|| format!("Invalid stored date: {date}"))?,
            times: serde_json::from_str(&times).context("Invalid stored prayer times")?,
            source,
            fetched_at: parse_timestamp(&fetched_at)?,
            expires_at: parse_timestamp(&expires_at)?,
        })
    }

    fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<PolicyRow> {
        Ok(PolicyRow {
            group_id: row.get(0)?,
            title: row.get(1)?,
            timezone: row.get(2)?,
            lead_minutes: row.get(3)?,
            offset_minutes: row.get(4)?,
            pre_alert: row.get(5)?,
            prayer_start: row.get(6)?,
            delayed_action: row.get(7)?,
            periodic: row.get(8)?,
            periodic_interval_minutes: row.get(9)?,
            active: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

const POLICY_COLUMNS: &str = "group_id, title, timezone, lead_minutes, offset_minutes, \
     pre_alert, prayer_start, delayed_action, periodic, periodic_interval_minutes, \
     active, created_at, updated_at";

/// Raw policy columns before timestamp parsing
struct PolicyRow {
    group_id: i64,
    title: Option<String>,
    timezone: String,
    lead_minutes: u32,
    offset_minutes: u32,
    pre_alert: bool,
    prayer_start: bool,
    delayed_action: bool,
    periodic: bool,
    periodic_interval_minutes: Option<u32>,
    active: bool,
    created_at: String,
    updated_at: String,
}

impl PolicyRow {
    fn into_policy(self) -> Result<GroupSchedulePolicy> {
        Ok(GroupSchedulePolicy {
            group: GroupId(self.group_id),
            title: self.title,
            timezone: self.timezone,
            lead_minutes: self.lead_minutes,
            offset_minutes: self.offset_minutes,
            toggles: EventToggles {
                pre_alert: self.pre_alert,
                prayer_start: self.prayer_start,
                delayed_action: self.delayed_action,
                periodic: self.periodic,
            },
            periodic_interval_minutes: self.periodic_interval_minutes,
            active: self.active,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid stored timestamp: {raw}"))?
        .with_timezone(&Utc))
}

impl PrayerTimesRepository for SqliteRepository {
    fn get(&self, date: NaiveDate) -> Result<Option<DailyPrayerTimes>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT date, times, source, fetched_at, expires_at
                 FROM prayer_times WHERE date = ?1",
                params![date.to_string()],
                Self::row_to_times,
            )
            .optional()
            .context("Failed to read prayer times")?;

        raw.map(Self::decode_times).transpose()
    }

    fn put(
        &self,
        entry: &DailyPrayerTimes,
        mode: PutMode,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin prayer times transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT expires_ms FROM prayer_times WHERE date = ?1",
                params![entry.date.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match (existing, mode) {
            (None, _) => PutOutcome::Inserted,
            (Some(expires_ms), PutMode::Insert) if expires_ms > now.timestamp_millis() => {
                let existing_expires_at =
                    DateTime::from_timestamp_millis(expires_ms).unwrap_or(now);
                return Ok(PutOutcome::Rejected {
                    existing_expires_at,
                });
            }
            (Some(_), _) => PutOutcome::Replaced,
        };

        tx.execute(
            "INSERT OR REPLACE INTO prayer_times
                (date, times, source, fetched_at, expires_at, expires_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.date.to_string(),
                serde_json::to_string(&entry.times)?,
                entry.source,
                entry.fetched_at.to_rfc3339(),
                entry.expires_at.to_rfc3339(),
                entry.expires_at.timestamp_millis(),
            ],
        )
        .context("Failed to write prayer times")?;
        tx.commit().context("Failed to commit prayer times")?;

        Ok(outcome)
    }

    fn delete_expired(&self, now: DateTime<Utc>, keep_from: Option<NaiveDate>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM prayer_times WHERE expires_ms <= ?1 AND (?2 IS NULL OR date < ?2)",
                params![now.timestamp_millis(), keep_from.map(|d| d.to_string())],
            )
            .context("Failed to purge expired prayer times")?;
        Ok(removed)
    }

    fn most_recent_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<DailyPrayerTimes>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT date, times, source, fetched_at, expires_at
                 FROM prayer_times WHERE date >= ?1 AND date <= ?2
                 ORDER BY date DESC LIMIT 1",
                params![from.to_string(), to.to_string()],
                Self::row_to_times,
            )
            .optional()
            .context("Failed to read recent prayer times")?;

        raw.map(Self::decode_times).transpose()
    }

    fn list(&self) -> Result<Vec<DailyPrayerTimes>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, times, source, fetched_at, expires_at
             FROM prayer_times ORDER BY date",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_times)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Self::decode_times).collect()
    }

    fn retain_newest(&self, max_entries: usize) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM prayer_times WHERE date NOT IN
                    (SELECT date FROM prayer_times ORDER BY date DESC LIMIT ?1)",
                params![max_entries as i64],
            )
            .context("Failed to trim prayer times")?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prayer_times", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

impl GroupPolicyRepository for SqliteRepository {
    fn upsert_policy(&self, policy: &GroupSchedulePolicy) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO group_policies ({POLICY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                policy.group.0,
                policy.title,
                policy.timezone,
                policy.lead_minutes,
                policy.offset_minutes,
                policy.toggles.pre_alert,
                policy.toggles.prayer_start,
                policy.toggles.delayed_action,
                policy.toggles.periodic,
                policy.periodic_interval_minutes,
                policy.active,
                policy.created_at.to_rfc3339(),
                policy.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save policy for group {}", policy.group))?;
        Ok(())
    }

    fn get_policy(&self, group: GroupId) -> Result<Option<GroupSchedulePolicy>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {POLICY_COLUMNS} FROM group_policies WHERE group_id = ?1"),
                params![group.0],
                Self::row_to_policy,
            )
            .optional()
            .context("Failed to read group policy")?;

        row.map(PolicyRow::into_policy).transpose()
    }

    fn list_policies(&self, active_only: bool) -> Result<Vec<GroupSchedulePolicy>> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!("SELECT {POLICY_COLUMNS} FROM group_policies WHERE active = 1 ORDER BY group_id")
        } else {
            format!("SELECT {POLICY_COLUMNS} FROM group_policies ORDER BY group_id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_policy)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(PolicyRow::into_policy).collect()
    }

    fn set_active(&self, group: GroupId, active: bool, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE group_policies SET active = ?2, updated_at = ?3 WHERE group_id = ?1",
                params![group.0, active, at.to_rfc3339()],
            )
            .context("Failed to update group active flag")?;
        Ok(changed > 0)
    }
}

impl DispatchLedger for SqliteRepository {
    fn try_record(&self, key: &DedupKey, mark: LedgerMark, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO dispatch_ledger
                    (group_id, class, occurrence, mark, recorded_at, recorded_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.group.0,
                    key.class.as_str(),
                    key.occurrence.as_str(),
                    mark.as_str(),
                    at.to_rfc3339(),
                    at.timestamp_millis(),
                ],
            )
            .context("Failed to record dispatch")?;
        Ok(inserted == 1)
    }

    fn contains(&self, key: &DedupKey) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM dispatch_ledger
                WHERE group_id = ?1 AND class = ?2 AND occurrence = ?3)",
            params![key.group.0, key.class.as_str(), key.occurrence.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn last_for_group(&self, group: GroupId) -> Result<Option<LedgerEntry>> {
        let conn = self.conn()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT class, occurrence, mark, recorded_at FROM dispatch_ledger
                 WHERE group_id = ?1 ORDER BY recorded_ms DESC LIMIT 1",
                params![group.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((class, occurrence, mark, recorded_at)) = row else {
            return Ok(None);
        };

        let class: EventClass = class.parse().map_err(|e: String| anyhow!(e))?;
        Ok(Some(LedgerEntry {
            key: DedupKey::new(group, class, OccurrenceKey::from_raw(occurrence)),
            mark: mark.parse().unwrap_or(LedgerMark::Dispatched),
            recorded_at: parse_timestamp(&recorded_at)?,
        }))
    }

    fn prune_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM dispatch_ledger WHERE recorded_ms < ?1",
                params![before.timestamp_millis()],
            )
            .context("Failed to prune dispatch ledger")?;
        Ok(removed)
    }
}

impl HealthRepository for SqliteRepository {
    fn save_source_health(&self, health: &SourceHealth) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO source_health (source, state, data, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                health.source,
                health.circuit.as_str(),
                serde_json::to_string(health)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to save source health")?;
        Ok(())
    }

    fn load_source_health(&self) -> Result<Vec<SourceHealth>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM source_health ORDER BY source")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.iter()
            .map(|data| serde_json::from_str(data).context("Invalid stored source health"))
            .collect()
    }

    fn save_alert(&self, alert: &Alert) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO alerts (id, severity, status, data, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alert.id,
                alert.severity.as_str(),
                alert.status.as_str(),
                serde_json::to_string(alert)?,
                alert.created_at.timestamp_millis(),
            ],
        )
        .context("Failed to save alert")?;
        Ok(())
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT data FROM alerts ORDER BY created_ms DESC, id LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.iter()
            .map(|data| serde_json::from_str(data).context("Invalid stored alert"))
            .collect()
    }
}

// ============================================================================
// Mock Implementation
// ============================================================================

/// In-memory implementation of every repository trait (for testing)
#[derive(Default)]
pub struct MockRepository {
    prayer_times: RwLock<BTreeMap<NaiveDate, DailyPrayerTimes>>,
    policies: RwLock<BTreeMap<GroupId, GroupSchedulePolicy>>,
    ledger: RwLock<HashMap<DedupKey, LedgerEntry>>,
    health: RwLock<BTreeMap<String, SourceHealth>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("mock repository lock poisoned")
}

impl PrayerTimesRepository for MockRepository {
    fn get(&self, date: NaiveDate) -> Result<Option<DailyPrayerTimes>> {
        Ok(self.prayer_times.read().map_err(poisoned)?.get(&date).cloned())
    }

    fn put(
        &self,
        entry: &DailyPrayerTimes,
        mode: PutMode,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        let mut map = self.prayer_times.write().map_err(poisoned)?;

        let outcome = match (map.get(&entry.date), mode) {
            (None, _) => PutOutcome::Inserted,
            (Some(existing), PutMode::Insert) if !existing.is_expired_at(now) => {
                return Ok(PutOutcome::Rejected {
                    existing_expires_at: existing.expires_at,
                });
            }
            (Some(_), _) => PutOutcome::Replaced,
        };

        map.insert(entry.date, entry.clone());
        Ok(outcome)
    }

    fn delete_expired(&self, now: DateTime<Utc>, keep_from: Option<NaiveDate>) -> Result<usize> {
        let mut map = self.prayer_times.write().map_err(poisoned)?;
        let before = map.len();
        map.retain(|date, entry| !entry.is_expired_at(now) || keep_from.is_some_and(|k| *date >= k));
        Ok(before - map.len())
    }

    fn most_recent_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<DailyPrayerTimes>> {
        if from > to {
            return Ok(None);
        }
        let map = self.prayer_times.read().map_err(poisoned)?;
        Ok(map.range(from..=to).next_back().map(|(_, e)| e.clone()))
    }

    fn list(&self) -> Result<Vec<DailyPrayerTimes>> {
        Ok(self
            .prayer_times
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect())
    }

    fn retain_newest(&self, max_entries: usize) -> Result<usize> {
        let mut map = self.prayer_times.write().map_err(poisoned)?;
        let excess = map.len().saturating_sub(max_entries);
        let oldest: Vec<NaiveDate> = map.keys().take(excess).copied().collect();
        for date in &oldest {
            map.remove(date);
        }
        Ok(oldest.len())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.prayer_times.read().map_err(poisoned)?.len())
    }
}

impl GroupPolicyRepository for MockRepository {
    fn upsert_policy(&self, policy: &GroupSchedulePolicy) -> Result<()> {
        self.policies
            .write()
            .map_err(poisoned)?
            .insert(policy.group, policy.clone());
        Ok(())
    }

    fn get_policy(&self, group: GroupId) -> Result<Option<GroupSchedulePolicy>> {
        Ok(self.policies.read().map_err(poisoned)?.get(&group).cloned())
    }

    fn list_policies(&self, active_only: bool) -> Result<Vec<GroupSchedulePolicy>> {
        Ok(self
            .policies
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|p| !active_only || p.active)
            .cloned()
            .collect())
    }

    fn set_active(&self, group: GroupId, active: bool, at: DateTime<Utc>) -> Result<bool> {
        let mut map = self.policies.write().map_err(poisoned)?;
        match map.get_mut(&group) {
            Some(policy) => {
                policy.active = active;
                policy.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl DispatchLedger for MockRepository {
    fn try_record(&self, key: &DedupKey, mark: LedgerMark, at: DateTime<Utc>) -> Result<bool> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        if ledger.contains_key(key) {
            return Ok(false);
        }
        ledger.insert(
            key.clone(),
            LedgerEntry {
                key: key.clone(),
                mark,
                recorded_at: at,
            },
        );
        Ok(true)
    }

    fn contains(&self, key: &DedupKey) -> Result<bool> {
        Ok(self.ledger.read().map_err(poisoned)?.contains_key(key))
    }

    fn last_for_group(&self, group: GroupId) -> Result<Option<LedgerEntry>> {
        Ok(self
            .ledger
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|e| e.key.group == group)
            .max_by_key(|e| e.recorded_at)
            .cloned())
    }

    fn prune_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        let count = ledger.len();
        ledger.retain(|_, e| e.recorded_at >= before);
        Ok(count - ledger.len())
    }
}

impl HealthRepository for MockRepository {
    fn save_source_health(&self, health: &SourceHealth) -> Result<()> {
        self.health
            .write()
            .map_err(poisoned)?
            .insert(health.source.clone(), health.clone());
        Ok(())
    }

    fn load_source_health(&self) -> Result<Vec<SourceHealth>> {
        Ok(self.health.read().map_err(poisoned)?.values().cloned().collect())
    }

    fn save_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().map_err(poisoned)?;
        match alerts.iter_mut().find(|a| a.id == alert.id) {
            Some(existing) => *existing = alert.clone(),
            None => alerts.push(alert.clone()),
        }
        Ok(())
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().map_err(poisoned)?;
        let mut recent: Vec<Alert> = alerts.clone();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }
}

// ============================================================================
// Shared Repository Types
// ============================================================================

pub type SharedPrayerTimesRepository = Arc<dyn PrayerTimesRepository>;
pub type SharedGroupPolicyRepository = Arc<dyn GroupPolicyRepository>;
pub type SharedDispatchLedger = Arc<dyn DispatchLedger>;
pub type SharedHealthRepository = Arc<dyn HealthRepository>;

/// One handle per repository trait, all backed by the same store
#[derive(Clone)]
pub struct Repositories {
    pub prayer_times: SharedPrayerTimesRepository,
    pub groups: SharedGroupPolicyRepository,
    pub ledger: SharedDispatchLedger,
    pub health: SharedHealthRepository,
}

impl Repositories {
    /// Build handles from a store implementing every trait
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: PrayerTimesRepository
            + GroupPolicyRepository
            + DispatchLedger
            + HealthRepository
            + 'static,
    {
        Self {
            prayer_times: store.clone(),
            groups: store.clone(),
            ledger: store.clone(),
            health: store,
        }
    }

    /// Open a SQLite database file
    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_store(Arc::new(SqliteRepository::new(path)?)))
    }

    /// In-memory store
    pub fn mock() -> Self {
        Self::from_store(Arc::new(MockRepository::new()))
    }
}

// ============================================================================
// Tests
// ============================================================================
