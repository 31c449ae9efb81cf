//! Circuit breaker lifecycle as seen through the health monitor

use chrono::{DateTime, Duration, TimeZone, Utc};
use mawaqit::config::HealthConfig;
use mawaqit::health::{CircuitState, HealthEvent, HealthMonitor};
use mawaqit::source::{SourceError, SourceFailure};
use mawaqit::storage::Repositories;
use mawaqit::validator::InvalidTimesError;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
}

fn timeout() -> HealthEvent {
    HealthEvent::Source(SourceError::new(
        "aladhan",
        SourceFailure::Timeout(std::time::Duration::from_secs(30)),
    ))
}

fn invalid() -> HealthEvent {
    HealthEvent::InvalidTimes {
        source: "aladhan".to_string(),
        error: InvalidTimesError::new("aladhan", "isha is not after maghrib"),
    }
}

fn success() -> HealthEvent {
    HealthEvent::Success {
        source: "aladhan".to_string(),
        latency: std::time::Duration::from_millis(120),
    }
}

async fn monitor() -> HealthMonitor {
    let monitor = HealthMonitor::new(HealthConfig::default());
    monitor.register_source("aladhan", 1).await;
    monitor
}

async fn trip(monitor: &HealthMonitor, at: DateTime<Utc>) {
    for i in 0..3 {
        monitor.record_at(timeout(), at + Duration::seconds(i)).await;
    }
}

#[tokio::test]
async fn test_cooldown_doubles_on_failed_probe_and_resets_on_success() {
    let monitor = monitor().await;
    trip(&monitor, t0()).await;
    let opened = t0() + Duration::seconds(2);

    let health = monitor.source_health("aladhan").await.unwrap();
    assert_eq!(health.circuit, CircuitState::Open);
    assert_eq!(health.cooldown_secs, 300);

    assert!(!monitor.allow_request_at("aladhan", opened + Duration::seconds(299)).await);
    assert!(monitor.allow_request_at("aladhan", opened + Duration::seconds(300)).await);
    assert_eq!(
        monitor.source_health("aladhan").await.unwrap().circuit,
        CircuitState::HalfOpen
    );

    // The probe fails: open again for twice as long
    let reopened = opened + Duration::seconds(301);
    monitor.record_at(timeout(), reopened).await;
    let health = monitor.source_health("aladhan").await.unwrap();
    assert_eq!(health.circuit, CircuitState::Open);
    assert_eq!(health.trips, 2);
    assert_eq!(health.cooldown_secs, 600);

    assert!(!monitor.allow_request_at("aladhan", reopened + Duration::seconds(599)).await);
    assert!(monitor.allow_request_at("aladhan", reopened + Duration::seconds(600)).await);

    monitor.record_at(success(), reopened + Duration::seconds(601)).await;
    let health = monitor.source_health("aladhan").await.unwrap();
    assert_eq!(health.circuit, CircuitState::Closed);
    assert_eq!(health.trips, 0);
    assert_eq!(health.cooldown_secs, 0);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_half_open_admits_single_probe() {
    let monitor = monitor().await;
    trip(&monitor, t0()).await;
    let probe_at = t0() + Duration::seconds(302);

    assert!(monitor.allow_request_at("aladhan", probe_at).await);
    assert!(!monitor.allow_request_at("aladhan", probe_at).await);
    assert!(!monitor.allow_request_at("aladhan", probe_at + Duration::seconds(5)).await);

    monitor.record_at(timeout(), probe_at + Duration::seconds(5)).await;
    assert!(monitor.is_open_at("aladhan", probe_at + Duration::seconds(6)).await);
    assert!(monitor
        .source_health("aladhan")
        .await
        .unwrap()
        .probe_started_at
        .is_none());
}

#[tokio::test]
async fn test_cooldown_is_capped() {
    let monitor = monitor().await;
    trip(&monitor, t0()).await;

    let mut at = t0() + Duration::seconds(2);
    let mut cooldowns = vec![monitor.source_health("aladhan").await.unwrap().cooldown_secs];
    for _ in 0..5 {
        let cooldown = *cooldowns.last().unwrap() as i64;
        at += Duration::seconds(cooldown);
        assert!(monitor.allow_request_at("aladhan", at).await);
        monitor.record_at(timeout(), at).await;
        cooldowns.push(monitor.source_health("aladhan").await.unwrap().cooldown_secs);
    }

    assert_eq!(cooldowns, vec![300, 600, 1200, 2400, 3600, 3600]);
}

#[tokio::test]
async fn test_quality_and_transport_counters_are_independent() {
    let monitor = monitor().await;

    monitor.record_at(timeout(), t0()).await;
    monitor.record_at(timeout(), t0()).await;
    monitor.record_at(invalid(), t0()).await;
    monitor.record_at(invalid(), t0()).await;

    let health = monitor.source_health("aladhan").await.unwrap();
    assert_eq!(health.circuit, CircuitState::Closed);
    assert_eq!(health.consecutive_failures, 2);
    assert_eq!(health.consecutive_quality_failures, 2);

    monitor.record_at(invalid(), t0()).await;
    assert!(monitor.is_open_at("aladhan", t0()).await);
}

#[tokio::test]
async fn test_open_too_long_raises_one_alert() {
    let monitor = monitor().await;
    trip(&monitor, t0()).await;

    assert!(monitor.evaluate_alerts_at(t0() + Duration::minutes(10)).await.is_empty());

    let raised = monitor.evaluate_alerts_at(t0() + Duration::minutes(31)).await;
    assert_eq!(raised.len(), 1);
    assert!(monitor
        .evaluate_alerts_at(t0() + Duration::minutes(40))
        .await
        .is_empty());
    assert_eq!(monitor.active_alerts().await.len(), 1);
}

#[tokio::test]
async fn test_open_circuit_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.db");

    {
        let repos = Repositories::sqlite(&path).unwrap();
        let monitor = HealthMonitor::new(HealthConfig::default()).with_repository(repos.health.clone());
        monitor.register_source("aladhan", 1).await;
        trip(&monitor, t0()).await;
    }

    let repos = Repositories::sqlite(&path).unwrap();
    let monitor = HealthMonitor::new(HealthConfig::default()).with_repository(repos.health.clone());
    let restored = tokio_test::assert_ok!(monitor.restore().await);
    assert_eq!(restored, 1);
    monitor.register_source("aladhan", 1).await;

    let health = monitor.source_health("aladhan").await.unwrap();
    assert_eq!(health.circuit, CircuitState::Open);
    assert_eq!(health.cooldown_secs, 300);
    assert!(monitor.is_open_at("aladhan", t0() + Duration::minutes(1)).await);
}
