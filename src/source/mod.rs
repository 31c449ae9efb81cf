//! Ranked upstream time sources with fallback
//!
//! ```text
//!   resolve(date, location)
//!        │
//!        ▼
//!   ┌───────────┐ disabled / circuit open ──► skipped
//!   │ rank by   │
//!   │ priority  │──► attempt (timeout) ──► standardize ──► validate ──► Ok
//!   └───────────┘         │ transport error       │ data-quality error
//!        ▲                ▼                       ▼
//!        └──────── next source ◄──── HealthMonitor.record(..)
//! ```
//!
//! Every source is tried at most once per resolution. When all of them fail
//! the caller gets [`ResolveError::AllSourcesExhausted`] and decides whether
//! stale cache is acceptable.

pub mod http;

pub use http::HttpTimeSource;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::health::{HealthEvent, HealthMonitor};
use crate::metrics;
use crate::models::{DailyPrayerTimes, Location};
use crate::validator::{self, DataValidator};

// ============================================================================
// Provider Kinds
// ============================================================================

/// Upstream response format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aladhan,
    IslamicFinder,
    PrayZone,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aladhan => "aladhan",
            Self::IslamicFinder => "islamicfinder",
            Self::PrayZone => "prayzone",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a single source attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("rate limited by upstream")]
    RateLimited,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl SourceFailure {
    /// Transport failures count toward the circuit breaker; malformed
    /// payloads count as data-quality failures instead
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// A failed attempt against a named source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub source: String,
    pub cause: SourceFailure,
}

impl SourceError {
    pub fn new(source: impl Into<String>, cause: SourceFailure) -> Self {
        Self {
            source: source.into(),
            cause,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source '{}' failed: {}", self.source, self.cause)
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Resolution failed on every candidate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error(
        "all sources exhausted for {date}: {} attempted, {} skipped",
        .attempted.len(),
        .skipped.len()
    )]
    AllSourcesExhausted {
        date: NaiveDate,
        attempted: Vec<SourceError>,
        skipped: Vec<String>,
    },
}

// ============================================================================
// Source Trait
// ============================================================================

/// Provider-named time strings as returned upstream
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrayerTimes {
    pub source: String,
    pub date: NaiveDate,
    /// e.g. `"Fajr" => "04:58 (EET)"`
    pub times: BTreeMap<String, String>,
}

/// One upstream provider of daily prayer times
#[async_trait]
pub trait TimeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Lower is tried first
    fn priority(&self) -> u32;

    async fn fetch(
        &self,
        date: NaiveDate,
        location: &Location,
    ) -> Result<RawPrayerTimes, SourceFailure>;
}

// ============================================================================
// Client
// ============================================================================

struct SourceSlot {
    source: Arc<dyn TimeSource>,
    priority: u32,
    enabled: bool,
}

/// Registered source as seen by operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
}

/// Resolves a day of prayer times across ranked sources
pub struct TimeSourceClient {
    sources: RwLock<Vec<SourceSlot>>,
    validator: DataValidator,
    health: Arc<HealthMonitor>,
    attempt_timeout: Duration,
    ttl: chrono::Duration,
}

impl TimeSourceClient {
    pub fn new(
        health: Arc<HealthMonitor>,
        validator: DataValidator,
        attempt_timeout: Duration,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            validator,
            health,
            attempt_timeout,
            ttl,
        }
    }

    /// Build the client with one HTTP source per configured provider
    pub async fn from_config(config: &Config, health: Arc<HealthMonitor>) -> anyhow::Result<Self> {
        let client = Self::new(
            health,
            DataValidator::new(config.validation.clone()),
            config.attempt_timeout(),
            config.cache.ttl(),
        );

        for provider in &config.sources.providers {
            let source = HttpTimeSource::new(provider, &config.sources)?;
            client.add_source(Arc::new(source)).await;
            if !provider.enabled {
                client.set_enabled(&provider.name, false).await;
            }
        }

        Ok(client)
    }

    /// Register a source and its health record
    pub async fn add_source(&self, source: Arc<dyn TimeSource>) {
        let name = source.name().to_string();
        let priority = source.priority();
        self.health.register_source(&name, priority).await;

        let mut sources = self.sources.write().await;
        sources.retain(|slot| slot.source.name() != name);
        sources.push(SourceSlot {
            source,
            priority,
            enabled: true,
        });
    }

    /// Enable or disable a source; false if unknown
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut sources = self.sources.write().await;
        match sources.iter_mut().find(|slot| slot.source.name() == name) {
            Some(slot) => {
                slot.enabled = enabled;
                tracing::info!(source = %name, enabled, "Source toggled");
                true
            }
            None => false,
        }
    }

    /// Change a source's rank; false if unknown
    pub async fn set_priority(&self, name: &str, priority: u32) -> bool {
        let mut sources = self.sources.write().await;
        match sources.iter_mut().find(|slot| slot.source.name() == name) {
            Some(slot) => {
                slot.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Registered sources in resolution order
    pub async fn sources(&self) -> Vec<SourceInfo> {
        self.ranked()
            .await
            .into_iter()
            .map(|(source, priority, enabled)| SourceInfo {
                name: source.name().to_string(),
                priority,
                enabled,
            })
            .collect()
    }

    async fn ranked(&self) -> Vec<(Arc<dyn TimeSource>, u32, bool)> {
        let sources = self.sources.read().await;
        let mut ranked: Vec<_> = sources
            .iter()
            .map(|slot| (Arc::clone(&slot.source), slot.priority, slot.enabled))
            .collect();
        ranked.sort_by_key(|(source, priority, _)| (*priority, source.name().to_string()));
        ranked
    }

    /// Resolve validated prayer times for a date
    pub async fn resolve(
        &self,
        date: NaiveDate,
        location: &Location,
    ) -> Result<DailyPrayerTimes, ResolveError> {
        let mut attempted = Vec::new();
        let mut skipped = Vec::new();

        for (source, _, enabled) in self.ranked().await {
            let name = source.name().to_string();

            if !enabled {
                skipped.push(name);
                continue;
            }
            if !self.health.allow_request(&name).await {
                tracing::debug!(source = %name, "Skipping source with open circuit");
                skipped.push(name);
                continue;
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(self.attempt_timeout, source.fetch(date, location))
                .await
                .unwrap_or(Err(SourceFailure::Timeout(self.attempt_timeout)));
            let latency = started.elapsed();
            metrics::observe_source_latency(&name, latency.as_secs_f64());

            let raw = match outcome {
                Ok(raw) => raw,
                Err(cause) => {
                    let error = SourceError::new(&name, cause);
                    tracing::warn!(source = %name, %date, error = %error.cause, "Source attempt failed");
                    metrics::record_source_request(&name, "failure");
                    self.health.record(HealthEvent::Source(error.clone())).await;
                    attempted.push(error);
                    continue;
                }
            };

            match self.standardize_and_validate(date, raw) {
                Ok(times) => {
                    tracing::info!(
                        source = %name,
                        %date,
                        latency_ms = latency.as_millis() as u64,
                        "Resolved prayer times"
                    );
                    metrics::record_source_request(&name, "success");
                    self.health
                        .record(HealthEvent::Success {
                            source: name,
                            latency,
                        })
                        .await;
                    return Ok(times);
                }
                Err(invalid) => {
                    tracing::warn!(source = %name, %date, reason = %invalid.reason, "Rejected invalid prayer times");
                    metrics::record_source_request(&name, "invalid");
                    let error = SourceError::new(&name, SourceFailure::Malformed(invalid.reason.clone()));
                    self.health
                        .record(HealthEvent::InvalidTimes {
                            source: name,
                            error: invalid,
                        })
                        .await;
                    attempted.push(error);
                }
            }
        }

        tracing::error!(
            %date,
            attempted = attempted.len(),
            skipped = skipped.len(),
            "All prayer time sources exhausted"
        );
        Err(ResolveError::AllSourcesExhausted {
            date,
            attempted,
            skipped,
        })
    }

    fn standardize_and_validate(
        &self,
        date: NaiveDate,
        raw: RawPrayerTimes,
    ) -> Result<DailyPrayerTimes, validator::InvalidTimesError> {
        let times = validator::standardize(
            &raw.source,
            raw.times.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        let entry = DailyPrayerTimes::new(date, times, raw.source, Utc::now(), self.ttl);
        self.validator.validate(&entry)?;
        Ok(entry)
    }
}
