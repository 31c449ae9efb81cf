//! Core data structures and types
//!
//! This module contains the value types shared by every component:
//!
//! - [`Prayer`] - the named daily prayers in canonical order
//! - [`DailyPrayerTimes`] - one resolved day of local prayer times
//! - [`ScheduledEvent`] - a computed, never persisted, trigger instant
//! - [`DedupKey`] - the at-most-once identity of an event occurrence

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Prayer
// ============================================================================

/// Named daily prayer instants.
///
/// Variant order is the canonical order of the day; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prayer {
    Fajr,
    Sunrise,
    Dhuhr,
    Asr,
    Maghrib,
    Isha,
}

impl Prayer {
    /// All instants in canonical order
    pub const ALL: [Prayer; 6] = [
        Prayer::Fajr,
        Prayer::Sunrise,
        Prayer::Dhuhr,
        Prayer::Asr,
        Prayer::Maghrib,
        Prayer::Isha,
    ];

    /// The five prayers that must be present and that anchor events
    pub const OBLIGATORY: [Prayer; 5] = [
        Prayer::Fajr,
        Prayer::Dhuhr,
        Prayer::Asr,
        Prayer::Maghrib,
        Prayer::Isha,
    ];

    /// Lowercase identifier used in keys and storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fajr => "fajr",
            Self::Sunrise => "sunrise",
            Self::Dhuhr => "dhuhr",
            Self::Asr => "asr",
            Self::Maghrib => "maghrib",
            Self::Isha => "isha",
        }
    }

    pub fn is_obligatory(&self) -> bool {
        !matches!(self, Self::Sunrise)
    }
}

impl fmt::Display for Prayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a prayer name cannot be recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown prayer name: {0}")]
pub struct UnknownPrayer(pub String);

impl FromStr for Prayer {
    type Err = UnknownPrayer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fajr" => Ok(Self::Fajr),
            "sunrise" | "shuruq" => Ok(Self::Sunrise),
            "dhuhr" | "zuhr" | "duhr" => Ok(Self::Dhuhr),
            "asr" => Ok(Self::Asr),
            "maghrib" => Ok(Self::Maghrib),
            "isha" => Ok(Self::Isha),
            _ => Err(UnknownPrayer(s.to_string())),
        }
    }
}

// ============================================================================
// Location
// ============================================================================

/// Geographic key sent to upstream providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub city: String,
    pub country: String,
    /// ISO 3166 alpha-2 code, some providers want it instead of the name
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Calculation method id (5 = Egyptian General Authority of Survey)
    pub method: u8,
    /// Juristic school for Asr (0 = Shafi, 1 = Hanafi)
    pub school: u8,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            city: "Cairo".to_string(),
            country: "Egypt".to_string(),
            country_code: "EG".to_string(),
            latitude: 30.0444,
            longitude: 31.2357,
            method: 5,
            school: 0,
        }
    }
}

// ============================================================================
// Daily Prayer Times
// ============================================================================

/// One calendar day of local wall-clock prayer times.
///
/// Immutable once cached. A refresh produces a new value that supersedes the
/// old one rather than mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPrayerTimes {
    /// Civil date the times describe (timezone-naive)
    pub date: NaiveDate,

    /// Local wall-clock instants keyed by prayer
    pub times: BTreeMap<Prayer, NaiveTime>,

    /// Identifier of the upstream source
    pub source: String,

    /// When the times were fetched
    pub fetched_at: DateTime<Utc>,

    /// When the cache entry stops being fresh
    pub expires_at: DateTime<Utc>,
}

impl DailyPrayerTimes {
    /// Build a new entry whose expiry is `fetched_at + ttl`
    pub fn new(
        date: NaiveDate,
        times: BTreeMap<Prayer, NaiveTime>,
        source: impl Into<String>,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            date,
            times,
            source: source.into(),
            fetched_at,
            expires_at: fetched_at + ttl,
        }
    }

    pub fn time_of(&self, prayer: Prayer) -> Option<NaiveTime> {
        self.times.get(&prayer).copied()
    }

    /// Local date-time of a prayer on this entry's date
    pub fn local_datetime(&self, prayer: Prayer) -> Option<NaiveDateTime> {
        self.time_of(prayer).map(|t| self.date.and_time(t))
    }

    /// Check freshness against a given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Iterate instants in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (Prayer, NaiveTime)> + '_ {
        self.times.iter().map(|(p, t)| (*p, *t))
    }

    /// Copy of these times relabelled for another date.
    ///
    /// Used when borrowing a neighbouring day's times as a best-effort
    /// fallback; the copy keeps the original expiry so it stays stale.
    pub fn redated(&self, date: NaiveDate) -> Self {
        Self {
            date,
            ..self.clone()
        }
    }
}

// ============================================================================
// Event Classes
// ============================================================================

/// Class of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Reminder ahead of a prayer
    PreAlert,
    /// The prayer itself
    PrayerStart,
    /// Post-prayer action (Quran portion) after an offset
    DelayedAction,
    /// Wall-clock remembrance, not prayer anchored
    Periodic,
}

impl EventClass {
    pub const ALL: [EventClass; 4] = [
        EventClass::PreAlert,
        EventClass::PrayerStart,
        EventClass::DelayedAction,
        EventClass::Periodic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreAlert => "pre_alert",
            Self::PrayerStart => "prayer_start",
            Self::DelayedAction => "delayed_action",
            Self::Periodic => "periodic",
        }
    }

    /// Dispatch priority when instants tie (lower first)
    pub fn priority(&self) -> u8 {
        match self {
            Self::PrayerStart => 0,
            Self::DelayedAction => 1,
            Self::PreAlert => 2,
            Self::Periodic => 3,
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_alert" => Ok(Self::PreAlert),
            "prayer_start" => Ok(Self::PrayerStart),
            "delayed_action" => Ok(Self::DelayedAction),
            "periodic" => Ok(Self::Periodic),
            other => Err(format!("unknown event class: {other}")),
        }
    }
}

/// Kind of periodic remembrance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicKind {
    MorningDhikr,
    EveningDhikr,
    IntervalDhikr,
}

impl PeriodicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MorningDhikr => "morning_dhikr",
            Self::EveningDhikr => "evening_dhikr",
            Self::IntervalDhikr => "interval_dhikr",
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Chat group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GroupId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One calendar instance of an event, the unit of dedup
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OccurrenceKey(String);

impl OccurrenceKey {
    /// Occurrence of a prayer on a civil date, e.g. `dhuhr/2025-03-10`
    pub fn prayer(prayer: Prayer, date: NaiveDate) -> Self {
        Self(format!("{}/{}", prayer.as_str(), date))
    }

    /// Occurrence of a periodic slot at a local wall-clock minute
    pub fn periodic(kind: PeriodicKind, slot: NaiveDateTime) -> Self {
        Self(format!("{}/{}", kind.as_str(), slot.format("%Y-%m-%dT%H:%M")))
    }

    /// Rebuild from a stored value
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// (group, event class, occurrence) tuple guaranteeing at-most-once dispatch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub group: GroupId,
    pub class: EventClass,
    pub occurrence: OccurrenceKey,
}

impl DedupKey {
    pub fn new(group: GroupId, class: EventClass, occurrence: OccurrenceKey) -> Self {
        Self {
            group,
            class,
            occurrence,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.class, self.occurrence)
    }
}

// ============================================================================
// Scheduled Events
// ============================================================================

/// Reference to the content a delivery should carry.
///
/// The core never renders content; the delivery collaborator resolves the
/// reference against its own corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    PrayerReminder { prayer: Prayer, minutes_before: u32 },
    PrayerCall { prayer: Prayer },
    QuranPortion { prayer: Prayer, minutes_after: u32 },
    Remembrance { remembrance: PeriodicKind },
}

/// A computed trigger instant for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub class: EventClass,
    pub group: GroupId,
    pub fire_at: DateTime<Utc>,
    /// Wall-clock time in the group's timezone, for logs and payloads
    pub local_time: NaiveDateTime,
    pub payload: PayloadRef,
    pub occurrence: OccurrenceKey,
    /// Derived from cache data past its freshness TTL
    pub stale: bool,
}

impl ScheduledEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.group, self.class, self.occurrence.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }

    /// How late the event would be if dispatched at `now` (zero if early)
    pub fn lateness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fire_at).max(Duration::zero())
    }
}

/// Sort events by instant, then class priority, then group
pub fn sort_events(events: &mut [ScheduledEvent]) {
    events.sort_by(|a, b| {
        a.fire_at
            .cmp(&b.fire_at)
            .then(a.class.priority().cmp(&b.class.priority()))
            .then(a.group.cmp(&b.group))
    });
}
