//! mawaqit - prayer-event scheduling with resilient time sources
//!
//! Resolves daily prayer times from ranked upstream providers, validates and
//! caches them, and dispatches per-group events (pre-alerts, prayer calls,
//! delayed actions, remembrance reminders) exactly once each.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Prayers, daily times, events and dedup keys
//! - [`source`] - Upstream providers and ranked fallback resolution
//! - [`validator`] - Plausibility checks on fetched times
//! - [`cache`] - TTL cache with stale fallback and snapshots
//! - [`resolver`] - Cache-first lookup that falls back to sources, then stale data
//! - [`health`] - Circuit breakers, error log and alerts
//! - [`groups`] - Group policies and the dispatch ledger
//! - [`scheduler`] - Event computation, dispatch loop and maintenance
//! - [`storage`] - Repository traits with SQLite and in-memory adapters
//! - [`notifications`] - Alert channels (webhook)
//! - [`server`] - Operational HTTP endpoints
//! - [`metrics`] - Prometheus registry
//! - [`utils`] - Timezone projection and retry helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mawaqit::cache::PrayerTimeCache;
//! use mawaqit::config::Config;
//! use mawaqit::health::HealthMonitor;
//! use mawaqit::resolver::TimesResolver;
//! use mawaqit::source::TimeSourceClient;
//! use mawaqit::storage::Repositories;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let repos = Repositories::mock();
//!     let health = Arc::new(HealthMonitor::from_config(&config.health)?);
//!     let client = Arc::new(TimeSourceClient::from_config(&config, health.clone()).await?);
//!     let cache = Arc::new(PrayerTimeCache::new(repos.prayer_times, config.cache.clone()));
//!     let resolver = TimesResolver::new(cache, client, health, config.sources.location.clone());
//!     // resolver.times_for(date, chrono::Utc::now()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod groups;
pub mod health;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod storage;
pub mod utils;
pub mod validator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::PrayerTimeCache;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, MawaqitErrorTrait, Result};
    pub use crate::groups::{ActiveGroupsManager, GroupSchedulePolicy};
    pub use crate::health::HealthMonitor;
    pub use crate::models::{
        DailyPrayerTimes, EventClass, GroupId, Location, Prayer, ScheduledEvent,
    };
    pub use crate::resolver::{TimesLookup, TimesResolver};
    pub use crate::scheduler::{EventDispatcher, ScheduleComputer};
    pub use crate::source::TimeSourceClient;
}

// Direct re-exports for convenience
pub use models::{DailyPrayerTimes, EventClass, GroupId, Prayer, ScheduledEvent};
