//! Ranked source fallback against mock upstream providers

mod common;

use std::sync::Arc;

use chrono::Duration;
use mawaqit::cache::PrayerTimeCache;
use mawaqit::health::{CircuitState, HealthMonitor, OverallStatus};
use mawaqit::models::Prayer;
use mawaqit::resolver::{TimesLookup, TimesResolver};
use mawaqit::scheduler::SchedulerError;
use mawaqit::source::{ResolveError, SourceFailure, TimeSourceClient};
use mawaqit::storage::Repositories;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{aladhan_body, cairo_at, config_for, date, islamicfinder_body};

struct Harness {
    resolver: TimesResolver,
    health: Arc<HealthMonitor>,
    cache: Arc<PrayerTimeCache>,
}

async fn harness(server: &MockServer) -> Harness {
    let config = config_for(&server.uri());
    let repos = Repositories::mock();
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let client = Arc::new(TimeSourceClient::from_config(&config, health.clone()).await.unwrap());
    let cache = Arc::new(PrayerTimeCache::new(repos.prayer_times.clone(), config.cache.clone()));
    let resolver = TimesResolver::new(
        cache.clone(),
        client,
        health.clone(),
        config.sources.location.clone(),
    );
    Harness {
        resolver,
        health,
        cache,
    }
}

#[tokio::test]
async fn test_primary_failure_falls_back_to_secondary() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/timingsByCity/10-03-2025"))
        .and(query_param("city", "Cairo"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .and(query_param("date", "2025-03-10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(islamicfinder_body()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let now = cairo_at(11, 0);

    let resolved = h.resolver.times_for(date(), now).await.unwrap();
    assert!(!resolved.stale);
    assert_eq!(resolved.times.source, "islamicfinder");
    assert_eq!(resolved.times.time_of(Prayer::Dhuhr).unwrap().to_string(), "12:05:00");
    assert_eq!(resolved.times.time_of(Prayer::Isha).unwrap().to_string(), "19:21:00");

    // Served from the cache: neither provider is called again
    let again = h.resolver.times_for(date(), now + Duration::minutes(5)).await.unwrap();
    assert_eq!(again.times, resolved.times);

    let stats = h.cache.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert!(stats.hits >= 1);

    let aladhan = h.health.source_health("aladhan").await.unwrap();
    assert_eq!(aladhan.consecutive_failures, 1);
    assert_eq!(aladhan.circuit, CircuitState::Closed);
    assert!(h.health.snapshot().await.service_risk.is_none());
}

#[tokio::test]
async fn test_primary_success_skips_secondary() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/timingsByCity/10-03-2025"))
        .respond_with(ResponseTemplate::new(200).set_body_json(aladhan_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .respond_with(ResponseTemplate::new(200).set_body_json(islamicfinder_body()))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let resolved = h.resolver.times_for(date(), cairo_at(11, 0)).await.unwrap();

    assert_eq!(resolved.times.source, "aladhan");
    assert_eq!(resolved.times.time_of(Prayer::Sunrise).unwrap().to_string(), "06:05:00");
}

#[tokio::test]
async fn test_error_code_in_body_is_data_quality_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/timingsByCity/10-03-2025"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 400, "status": "Bad Request"})),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .respond_with(ResponseTemplate::new(200).set_body_json(islamicfinder_body()))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let resolved = h.resolver.times_for(date(), cairo_at(11, 0)).await.unwrap();
    assert_eq!(resolved.times.source, "islamicfinder");

    let aladhan = h.health.source_health("aladhan").await.unwrap();
    assert_eq!(aladhan.consecutive_failures, 0);
    assert_eq!(aladhan.consecutive_quality_failures, 1);
}

#[tokio::test]
async fn test_implausible_times_rejected() {
    let server = MockServer::start().await;

    // Isha before Maghrib
    let mut body = aladhan_body();
    body["data"]["timings"]["Isha"] = json!("17:00");
    Mock::given(method("GET"))
        .and(path("/v1/timingsByCity/10-03-2025"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .respond_with(ResponseTemplate::new(200).set_body_json(islamicfinder_body()))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let resolved = h.resolver.times_for(date(), cairo_at(11, 0)).await.unwrap();
    assert_eq!(resolved.times.source, "islamicfinder");
    assert!(h.health.error_statistics().await.total >= 1);
}

#[tokio::test]
async fn test_all_sources_fail_without_cache() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let err = h.resolver.times_for(date(), cairo_at(11, 0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NoScheduleAvailable { date: d } if d == date()));

    let report = h.health.snapshot().await;
    assert_eq!(report.service_risk, Some(date()));
    assert_eq!(report.status, OverallStatus::Critical);
    // Two source failures plus the scheduling record
    assert_eq!(report.errors.total, 3);
    assert_eq!(report.errors.by_category.get("api"), Some(&2));
    assert_eq!(report.active_alerts.len(), 1);
}

#[tokio::test]
async fn test_open_circuit_skips_primary() {
    let server = MockServer::start().await;

    // Default threshold is three transport failures
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/timingsByCity/.+$"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .respond_with(ResponseTemplate::new(200).set_body_json(islamicfinder_body()))
        .expect(4)
        .mount(&server)
        .await;

    let config = config_for(&server.uri());
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let client = TimeSourceClient::from_config(&config, health.clone()).await.unwrap();
    let location = config.sources.location.clone();

    for offset in 0..4 {
        let day = date() + Duration::days(offset);
        let times = client.resolve(day, &location).await.unwrap();
        assert_eq!(times.source, "islamicfinder");
    }

    assert!(health.is_open("aladhan").await);
    let aladhan = health.source_health("aladhan").await.unwrap();
    assert_eq!(aladhan.circuit, CircuitState::Open);
    assert_eq!(aladhan.cooldown_secs, 300);
}

#[tokio::test]
async fn test_rate_limited_is_transport_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/timingsByCity/10-03-2025"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/prayer_times"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = config_for(&server.uri());
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let client = TimeSourceClient::from_config(&config, health).await.unwrap();

    let err = client
        .resolve(date(), &config.sources.location)
        .await
        .unwrap_err();
    let ResolveError::AllSourcesExhausted { attempted, skipped, .. } = err;
    assert!(skipped.is_empty());
    assert_eq!(attempted.len(), 2);
    assert_eq!(attempted[0].cause, SourceFailure::RateLimited);
    assert_eq!(attempted[1].cause, SourceFailure::Status(404));
}
