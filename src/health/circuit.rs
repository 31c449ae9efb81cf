//! Per-source circuit breaker
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────► OPEN
//!     ▲                                │ cooldown elapsed
//!     │ probe succeeds                 ▼
//!     └──────────────────────────── HALF_OPEN
//!                                      │ probe fails
//!                                      └──► OPEN (cooldown doubled, capped)
//! ```
//!
//! Transport failures and data-quality failures trip the circuit on
//! independent counters; a success resets both. HALF_OPEN admits a single
//! probe until its outcome is recorded.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::utils::retry::RetryConfig;

/// A probe that never reports (cancelled caller) frees the slot after this
const PROBE_LEASE_SECS: i64 = 120;

// ============================================================================
// Circuit State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Thresholds and back-off for tripping a circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitPolicy {
    /// Consecutive transport failures before opening
    pub failure_threshold: u32,
    /// Consecutive data-quality failures before opening
    pub quality_threshold: u32,
    /// Cooldown growth per consecutive trip
    pub cooldown: RetryConfig,
}

impl CircuitPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            quality_threshold: config.data_quality_threshold,
            cooldown: RetryConfig::from_secs(
                config.base_cooldown_secs,
                config.max_cooldown_secs,
                config.cooldown_multiplier,
            ),
        }
    }
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

// ============================================================================
// Source Statistics
// ============================================================================

/// Request counters kept for reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Running mean of successful response times
    pub avg_response_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceStats {
    /// Fraction of successful requests; 1.0 before any request
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

// ============================================================================
// Source Health
// ============================================================================

/// Mutable health record of one upstream source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub priority: u32,
    pub circuit: CircuitState,
    /// Consecutive transport failures
    pub consecutive_failures: u32,
    /// Consecutive validation failures
    pub consecutive_quality_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Cooldown of the current open period
    pub cooldown_secs: u64,
    /// Trips since the circuit last closed; drives the back-off
    pub trips: u32,
    /// Start of the half-open probe awaiting its outcome
    #[serde(default)]
    pub probe_started_at: Option<DateTime<Utc>>,
    pub stats: SourceStats,
    pub updated_at: DateTime<Utc>,
}

impl SourceHealth {
    pub fn new(source: &str, priority: u32) -> Self {
        Self {
            source: source.to_string(),
            priority,
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_quality_failures: 0,
            opened_at: None,
            cooldown_secs: 0,
            trips: 0,
            probe_started_at: None,
            stats: SourceStats::default(),
            updated_at: Utc::now(),
        }
    }

    /// Successful, validated fetch. Closes the circuit.
    pub fn record_success(&mut self, now: DateTime<Utc>, latency: std::time::Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let stats = &mut self.stats;
        stats.requests += 1;
        stats.successes += 1;
        stats.avg_response_ms += (latency_ms - stats.avg_response_ms) / stats.successes as f64;
        stats.last_success = Some(now);

        self.consecutive_failures = 0;
        self.consecutive_quality_failures = 0;
        self.circuit = CircuitState::Closed;
        self.opened_at = None;
        self.cooldown_secs = 0;
        self.trips = 0;
        self.probe_started_at = None;
        self.updated_at = now;
    }

    /// Timeout, connection or HTTP failure. Returns true if the circuit tripped.
    pub fn record_transport_failure(
        &mut self,
        now: DateTime<Utc>,
        error: &str,
        policy: &CircuitPolicy,
    ) -> bool {
        self.note_failure(now, error);
        self.consecutive_failures += 1;
        self.maybe_trip(now, self.consecutive_failures >= policy.failure_threshold, policy)
    }

    /// Malformed or implausible payload. Returns true if the circuit tripped.
    pub fn record_quality_failure(
        &mut self,
        now: DateTime<Utc>,
        reason: &str,
        policy: &CircuitPolicy,
    ) -> bool {
        self.note_failure(now, reason);
        self.consecutive_quality_failures += 1;
        self.maybe_trip(
            now,
            self.consecutive_quality_failures >= policy.quality_threshold,
            policy,
        )
    }

    fn note_failure(&mut self, now: DateTime<Utc>, error: &str) {
        self.stats.requests += 1;
        self.stats.failures += 1;
        self.stats.last_failure = Some(now);
        self.stats.last_error = Some(error.to_string());
        self.updated_at = now;
    }

    fn maybe_trip(&mut self, now: DateTime<Utc>, threshold_reached: bool, policy: &CircuitPolicy) -> bool {
        let trip = match self.circuit {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => threshold_reached,
            CircuitState::Open => false,
        };
        if trip {
            self.trips += 1;
            self.cooldown_secs = policy.cooldown.calculate_delay(self.trips).as_secs();
            self.circuit = CircuitState::Open;
            self.opened_at = Some(now);
            self.probe_started_at = None;
        }
        trip
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened) => now >= opened + Duration::seconds(self.cooldown_secs as i64),
            None => true,
        }
    }

    /// May a request be sent now? Moves an expired OPEN circuit to HALF_OPEN
    /// and hands out the single probe slot.
    pub fn allow_request(&mut self, now: DateTime<Utc>) -> bool {
        match self.circuit {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let in_flight = self
                    .probe_started_at
                    .is_some_and(|started| now < started + Duration::seconds(PROBE_LEASE_SECS));
                if !in_flight {
                    self.probe_started_at = Some(now);
                }
                !in_flight
            }
            CircuitState::Open if self.cooldown_elapsed(now) => {
                self.circuit = CircuitState::HalfOpen;
                self.probe_started_at = Some(now);
                self.updated_at = now;
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Open and still cooling down
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.circuit == CircuitState::Open && !self.cooldown_elapsed(now)
    }

    /// How long the circuit has been away from CLOSED
    pub fn open_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.circuit {
            CircuitState::Closed => None,
            _ => self.opened_at.map(|opened| now - opened),
        }
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self.circuit {
            CircuitState::Open => self
                .opened_at
                .map(|opened| opened + Duration::seconds(self.cooldown_secs as i64)),
            _ => None,
        }
    }

    pub fn is_healthy(&self, min_success_rate: f64) -> bool {
        self.circuit == CircuitState::Closed && self.stats.success_rate() >= min_success_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-10T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_opens_after_threshold() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);

        assert!(!health.record_transport_failure(t0(), "timeout", &policy));
        assert!(!health.record_transport_failure(t0(), "timeout", &policy));
        assert!(!health.is_open(t0()));
        assert!(health.record_transport_failure(t0(), "timeout", &policy));

        assert!(health.is_open(t0()));
        assert_eq!(health.circuit, CircuitState::Open);
        assert_eq!(health.cooldown_secs, 300);
        assert!(!health.allow_request(t0() + Duration::seconds(299)));
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);
        for _ in 0..3 {
            health.record_transport_failure(t0(), "503", &policy);
        }

        let later = t0() + Duration::seconds(300);
        assert!(!health.is_open(later));
        assert!(health.allow_request(later));
        assert_eq!(health.circuit, CircuitState::HalfOpen);

        health.record_success(later, std::time::Duration::from_millis(120));
        assert_eq!(health.circuit, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.trips, 0);
        assert!(health.open_for(later).is_none());
    }

    #[test]
    fn test_half_open_admits_one_probe() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);
        for _ in 0..3 {
            health.record_transport_failure(t0(), "503", &policy);
        }

        let later = t0() + Duration::seconds(300);
        assert!(health.allow_request(later));
        assert!(!health.allow_request(later));
        assert!(!health.allow_request(later + Duration::seconds(30)));

        // The probe never reported back
        assert!(health.allow_request(later + Duration::seconds(PROBE_LEASE_SECS)));

        health.record_success(later, std::time::Duration::from_millis(90));
        assert!(health.probe_started_at.is_none());
        assert!(health.allow_request(later));
        assert!(health.allow_request(later));
    }

    #[test]
    fn test_half_open_failure_doubles_cooldown() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);
        for _ in 0..3 {
            health.record_transport_failure(t0(), "timeout", &policy);
        }

        let mut now = t0();
        let mut cooldowns = vec![health.cooldown_secs];
        for _ in 0..4 {
            now += Duration::seconds(health.cooldown_secs as i64);
            assert!(health.allow_request(now));
            assert!(health.record_transport_failure(now, "timeout", &policy));
            cooldowns.push(health.cooldown_secs);
        }

        assert_eq!(cooldowns, vec![300, 600, 1200, 2400, 3600]);
        assert_eq!(health.retry_at(), Some(now + Duration::seconds(3600)));
    }

    #[test]
    fn test_quality_failures_tracked_independently() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("prayzone", 3);

        health.record_transport_failure(t0(), "timeout", &policy);
        health.record_transport_failure(t0(), "timeout", &policy);
        assert!(!health.record_quality_failure(t0(), "out of order", &policy));
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.consecutive_quality_failures, 1);
        assert_eq!(health.circuit, CircuitState::Closed);

        health.record_quality_failure(t0(), "out of order", &policy);
        assert!(health.record_quality_failure(t0(), "out of order", &policy));
        assert!(health.is_open(t0()));
    }

    #[test]
    fn test_stats_and_health() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);
        assert_eq!(health.stats.success_rate(), 1.0);

        health.record_success(t0(), std::time::Duration::from_millis(100));
        health.record_success(t0(), std::time::Duration::from_millis(300));
        health.record_transport_failure(t0(), "timeout", &policy);

        assert_eq!(health.stats.requests, 3);
        assert!((health.stats.avg_response_ms - 200.0).abs() < 1e-6);
        assert!((health.stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!health.is_healthy(0.7));
        assert!(health.is_healthy(0.6));
        assert_eq!(health.stats.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_state() {
        let policy = CircuitPolicy::default();
        let mut health = SourceHealth::new("aladhan", 1);
        for _ in 0..3 {
            health.record_transport_failure(t0(), "timeout", &policy);
        }
        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("\"circuit\":\"open\""));
        let back: SourceHealth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, health);
    }
}
