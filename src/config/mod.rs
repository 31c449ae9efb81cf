//! Configuration management for mawaqit
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has defaults, so a file only needs
//! the values it changes.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::Location;
use crate::notifications::WebhookConfig;
use crate::source::ProviderKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream prayer time providers
    pub sources: SourcesConfig,

    /// Prayer time cache
    pub cache: CacheConfig,

    /// Data validation thresholds
    pub validation: ValidationConfig,

    /// Circuit breaking and alerting
    pub health: HealthConfig,

    /// Event scheduling and dispatch
    pub scheduler: SchedulerConfig,

    /// Persistent store
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Operational HTTP server
    pub server: ServerConfig,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Location sent to every provider
    pub location: Location,

    /// Bound on a single provider attempt, in seconds
    pub attempt_timeout_secs: u64,

    /// Outbound rate limit per provider (requests per second)
    pub requests_per_second: u32,

    /// User agent string
    pub user_agent: String,

    /// Ranked provider list
    pub providers: Vec<ProviderConfig>,
}

/// One upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Lower is tried first
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window from fetch time
    pub ttl_hours: i64,

    /// Interval between expired-entry sweeps
    pub purge_interval_secs: u64,

    /// Newest dates kept in the store
    pub max_entries: usize,

    /// Serve expired entries when every source fails
    pub stale_fallback: bool,

    /// How many days back a neighbouring day's times may be borrowed
    /// when the needed date has no entry at all (0 disables borrowing)
    pub stale_lookback_days: u32,

    /// Optional JSON snapshot file for warm starts
    pub snapshot_path: Option<PathBuf>,
}

/// Validation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Smallest gap allowed between consecutive instants
    pub min_gap_minutes: i64,

    /// Apply per-prayer plausibility hour windows and interval checks
    pub check_windows: bool,

    /// Reports scoring below this are rejected
    pub min_quality_score: i32,
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive transport failures that open a circuit
    pub failure_threshold: u32,

    /// Consecutive data-quality failures that open a circuit
    pub data_quality_threshold: u32,

    /// First cooldown after a circuit opens
    pub base_cooldown_secs: u64,

    /// Upper bound for the doubled cooldown
    pub max_cooldown_secs: u64,

    pub cooldown_multiplier: f64,

    /// Alert when a circuit stays open longer than this
    pub open_alert_after_secs: i64,

    /// Success rate at or above which a source is reported healthy
    pub healthy_success_rate: f64,

    /// Capacity of the error record ring
    pub max_error_records: usize,

    /// Interval between health and alert evaluations
    pub check_interval_secs: u64,

    /// Optional operator webhook for alerts
    pub alert_webhook: Option<WebhookConfig>,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Timezone for new groups
    pub default_timezone: String,

    /// Longest the dispatcher sleeps before recomputing
    pub max_idle_secs: u64,

    /// Lateness tolerated for pre-alerts and prayer-start events
    pub prayer_grace_minutes: i64,

    /// Lateness tolerated for delayed actions
    pub delayed_grace_minutes: i64,

    /// Lateness tolerated for periodic reminders
    pub periodic_grace_minutes: i64,

    /// Groups processed in parallel per pass
    pub dispatch_concurrency: usize,

    /// Local wall-clock time of the morning remembrance ("HH:MM")
    pub morning_time: String,

    /// Local wall-clock time of the evening remembrance ("HH:MM")
    pub evening_time: String,

    /// Days dedup ledger rows are kept
    pub ledger_retention_days: i64,

    /// Interval between next-day prefetches
    pub prefetch_interval_secs: u64,

    /// Optional delivery endpoint; events are only logged when absent
    pub delivery_webhook: Option<WebhookConfig>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Operational HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

// ============================================================================
// Defaults
// ============================================================================

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            location: Location::default(),
            attempt_timeout_secs: 30,
            requests_per_second: 2,
            user_agent: format!("mawaqit/{}", env!("CARGO_PKG_VERSION")),
            providers: default_providers(),
        }
    }
}

/// Default ranked provider list
pub fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "aladhan".to_string(),
            kind: ProviderKind::Aladhan,
            base_url: "https://api.aladhan.com/v1/timingsByCity".to_string(),
            priority: 1,
            enabled: true,
        },
        ProviderConfig {
            name: "islamicfinder".to_string(),
            kind: ProviderKind::IslamicFinder,
            base_url: "https://www.islamicfinder.org/api/prayer_times".to_string(),
            priority: 2,
            enabled: true,
        },
        ProviderConfig {
            name: "prayzone".to_string(),
            kind: ProviderKind::PrayZone,
            base_url: "https://api.pray.zone/v2/times/day.json".to_string(),
            priority: 3,
            enabled: true,
        },
    ]
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            purge_interval_secs: 3600,
            max_entries: 100,
            stale_fallback: true,
            stale_lookback_days: 0,
            snapshot_path: None,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_gap_minutes: 10,
            check_windows: true,
            min_quality_score: 70,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            data_quality_threshold: 3,
            base_cooldown_secs: 300, // 5 minutes
            max_cooldown_secs: 3600,
            cooldown_multiplier: 2.0,
            open_alert_after_secs: 1800,
            healthy_success_rate: 0.7,
            max_error_records: 1000,
            check_interval_secs: 300,
            alert_webhook: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timezone: "Africa/Cairo".to_string(),
            max_idle_secs: 60,
            prayer_grace_minutes: 30,
            delayed_grace_minutes: 60,
            periodic_grace_minutes: 30,
            dispatch_concurrency: 8,
            morning_time: "05:30".to_string(),
            evening_time: "19:30".to_string(),
            ledger_retention_days: 7,
            prefetch_interval_secs: 6 * 3600,
            delivery_webhook: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/mawaqit.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: String::from("0.0.0.0:8080"),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        let location = &mut config.sources.location;
        location.city = env_or("MAWAQIT_CITY", location.city.clone());
        location.country = env_or("MAWAQIT_COUNTRY", location.country.clone());
        location.country_code = env_or("MAWAQIT_COUNTRY_CODE", location.country_code.clone());
        location.latitude = env_or("MAWAQIT_LATITUDE", location.latitude);
        location.longitude = env_or("MAWAQIT_LONGITUDE", location.longitude);
        location.method = env_or("MAWAQIT_METHOD", location.method);

        config.sources.attempt_timeout_secs = env_or("MAWAQIT_SOURCE_TIMEOUT", 30);
        config.sources.requests_per_second = env_or("MAWAQIT_RATE_LIMIT", 2);

        config.cache.ttl_hours = env_or("MAWAQIT_CACHE_TTL_HOURS", 24);
        config.cache.stale_fallback = env_or("MAWAQIT_STALE_FALLBACK", true);
        config.cache.stale_lookback_days = env_or("MAWAQIT_STALE_LOOKBACK_DAYS", 0);
        config.cache.snapshot_path = std::env::var("MAWAQIT_CACHE_SNAPSHOT").ok().map(PathBuf::from);

        config.health.failure_threshold = env_or("MAWAQIT_FAILURE_THRESHOLD", 3);
        config.health.base_cooldown_secs = env_or("MAWAQIT_COOLDOWN_SECS", 300);
        config.health.max_cooldown_secs = env_or("MAWAQIT_MAX_COOLDOWN_SECS", 3600);
        config.health.alert_webhook = std::env::var("MAWAQIT_ALERT_WEBHOOK")
            .ok()
            .map(WebhookConfig::new);

        config.scheduler.default_timezone =
            env_or("MAWAQIT_TIMEZONE", String::from("Africa/Cairo"));
        config.scheduler.delivery_webhook = std::env::var("MAWAQIT_DELIVERY_WEBHOOK")
            .ok()
            .map(WebhookConfig::new);

        config.storage.sqlite_path = std::env::var("MAWAQIT_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/mawaqit.db"))
            .into();

        config.logging.level = env_or("MAWAQIT_LOG_LEVEL", String::from("info"));
        config.logging.format = env_or("MAWAQIT_LOG_FORMAT", String::from("text"));

        config.server.enabled = env_or("MAWAQIT_SERVER_ENABLED", true);
        config.server.bind = env_or("MAWAQIT_BIND", String::from("0.0.0.0:8080"));

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sources.providers.iter().all(|p| !p.enabled) {
            anyhow::bail!("at least one enabled provider is required");
        }

        let mut names = HashSet::new();
        for provider in &self.sources.providers {
            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider name: {}", provider.name);
            }
            url::Url::parse(&provider.base_url)
                .with_context(|| format!("invalid base_url for provider {}", provider.name))?;
        }

        if self.sources.attempt_timeout_secs == 0 {
            anyhow::bail!("attempt_timeout_secs must be greater than 0");
        }

        if self.sources.requests_per_second == 0 {
            anyhow::bail!("requests_per_second must be greater than 0");
        }

        if self.cache.ttl_hours <= 0 {
            anyhow::bail!("cache ttl_hours must be positive");
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache max_entries must be greater than 0");
        }

        if !(0..=100).contains(&self.validation.min_quality_score) {
            anyhow::bail!("min_quality_score must be within 0-100");
        }

        if self.validation.min_gap_minutes < 0 {
            anyhow::bail!("min_gap_minutes cannot be negative");
        }

        if self.health.failure_threshold == 0 || self.health.data_quality_threshold == 0 {
            anyhow::bail!("circuit thresholds must be greater than 0");
        }

        if self.health.base_cooldown_secs == 0
            || self.health.base_cooldown_secs > self.health.max_cooldown_secs
        {
            anyhow::bail!("cooldown must satisfy 0 < base_cooldown_secs <= max_cooldown_secs");
        }

        if self.health.cooldown_multiplier < 1.0 {
            anyhow::bail!("cooldown_multiplier must be at least 1.0");
        }

        if !(0.0..=1.0).contains(&self.health.healthy_success_rate) {
            anyhow::bail!("healthy_success_rate must be within 0.0-1.0");
        }

        if self.health.max_error_records == 0 {
            anyhow::bail!("max_error_records must be greater than 0");
        }

        if crate::utils::parse_timezone(&self.scheduler.default_timezone).is_none() {
            anyhow::bail!("unknown timezone: {}", self.scheduler.default_timezone);
        }

        self.scheduler.morning()?;
        self.scheduler.evening()?;

        if self.scheduler.dispatch_concurrency == 0 {
            anyhow::bail!("dispatch_concurrency must be greater than 0");
        }

        if self.scheduler.max_idle_secs == 0 {
            anyhow::bail!("max_idle_secs must be greater than 0");
        }

        if self.server.enabled {
            self.server
                .bind
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("invalid server bind address: {}", self.server.bind))?;
        }

        for webhook in [&self.health.alert_webhook, &self.scheduler.delivery_webhook]
            .into_iter()
            .flatten()
        {
            webhook.validate().map_err(anyhow::Error::msg)?;
        }

        Ok(())
    }

    /// Get attempt timeout as Duration
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.sources.attempt_timeout_secs)
    }
}

impl SchedulerConfig {
    /// Parsed morning remembrance time
    pub fn morning(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.morning_time, "%H:%M")
            .with_context(|| format!("invalid morning_time: {}", self.morning_time))
    }

    /// Parsed evening remembrance time
    pub fn evening(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.evening_time, "%H:%M")
            .with_context(|| format!("invalid evening_time: {}", self.evening_time))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.providers.len(), 3);
        assert_eq!(config.sources.providers[0].name, "aladhan");
    }

    #[test]
    fn test_attempt_timeout_conversion() {
        let config = Config::default();
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache.ttl(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_rejects_all_providers_disabled() {
        let mut config = Config::default();
        for provider in &mut config.sources.providers {
            provider.enabled = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_provider_names() {
        let mut config = Config::default();
        config.sources.providers[1].name = "aladhan".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_cooldown_and_timezone() {
        let mut config = Config::default();
        config.health.base_cooldown_secs = 7200;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.default_timezone = "Nowhere/City".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.morning_time = "25:99".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl_hours = 12
            stale_lookback_days = 7

            [scheduler]
            default_timezone = "Asia/Riyadh"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl_hours, 12);
        assert_eq!(config.cache.stale_lookback_days, 7);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.scheduler.default_timezone, "Asia/Riyadh");
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mawaqit.toml");
        std::fs::write(
            &path,
            r#"
            [[sources.providers]]
            name = "local"
            kind = "aladhan"
            base_url = "http://127.0.0.1:9000/v1/timingsByCity"
            priority = 1
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sources.providers.len(), 1);
        assert!(config.sources.providers[0].enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("MAWAQIT_CITY", "Alexandria");
        std::env::set_var("MAWAQIT_FAILURE_THRESHOLD", "5");
        std::env::set_var("MAWAQIT_STALE_FALLBACK", "false");
        std::env::set_var("MAWAQIT_SOURCE_TIMEOUT", "not-a-number");

        let config = Config::from_env().unwrap();

        std::env::remove_var("MAWAQIT_CITY");
        std::env::remove_var("MAWAQIT_FAILURE_THRESHOLD");
        std::env::remove_var("MAWAQIT_STALE_FALLBACK");
        std::env::remove_var("MAWAQIT_SOURCE_TIMEOUT");

        assert_eq!(config.sources.location.city, "Alexandria");
        assert_eq!(config.health.failure_threshold, 5);
        assert!(!config.cache.stale_fallback);
        assert_eq!(config.sources.attempt_timeout_secs, 30);
    }
}
