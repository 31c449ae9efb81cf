//! Prometheus metrics for mawaqit
//!
//! This module provides metrics tracking for:
//! - Time sources: request outcomes, latency, circuit state and trips
//! - Cache: lookups by result, stored entries, stale schedules served
//! - Dispatch: events by class and outcome, active groups
//! - Health: error records and alerts
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::health::CircuitState;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Upstream source metrics
struct SourceMetrics {
    requests: CounterVec,
    latency: HistogramVec,
    circuit_state: GaugeVec,
    circuit_trips: CounterVec,
}

/// Cache, dispatch and health metrics
struct ServiceMetrics {
    cache_lookups: CounterVec,
    cache_entries: Gauge,
    stale_schedules: Counter,
    dispatched: CounterVec,
    active_groups: Gauge,
    errors: CounterVec,
    alerts: CounterVec,
    maintenance_duration: HistogramVec,
}

static SOURCE_METRICS: OnceLock<SourceMetrics> = OnceLock::new();

static SERVICE_METRICS: OnceLock<ServiceMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = mawaqit::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
///     // Application can continue without metrics
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let source = SourceMetrics {
        requests: register_counter_vec!(
            "mawaqit_source_requests_total",
            "Prayer time source requests by outcome",
            &["source", "outcome"]
        )?,
        latency: register_histogram_vec!(
            "mawaqit_source_request_duration_seconds",
            "Prayer time source request duration in seconds",
            &["source"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        circuit_state: register_gauge_vec!(
            "mawaqit_source_circuit_state",
            "Circuit state per source (0 = closed, 1 = half open, 2 = open)",
            &["source"]
        )?,
        circuit_trips: register_counter_vec!(
            "mawaqit_source_circuit_trips_total",
            "Times a source circuit opened",
            &["source"]
        )?,
    };

    let service = ServiceMetrics {
        cache_lookups: register_counter_vec!(
            "mawaqit_cache_lookups_total",
            "Cache lookups by result",
            &["result"]
        )?,
        cache_entries: register_gauge!(
            "mawaqit_cache_entries",
            "Prayer time entries currently stored"
        )?,
        stale_schedules: register_counter!(
            "mawaqit_stale_schedules_total",
            "Schedules computed from expired prayer times"
        )?,
        dispatched: register_counter_vec!(
            "mawaqit_events_total",
            "Scheduled events by class and dispatch outcome",
            &["class", "outcome"]
        )?,
        active_groups: register_gauge!(
            "mawaqit_active_groups",
            "Groups receiving events"
        )?,
        errors: register_counter_vec!(
            "mawaqit_errors_total",
            "Classified errors by category and severity",
            &["category", "severity"]
        )?,
        alerts: register_counter_vec!(
            "mawaqit_alerts_total",
            "Alerts raised by severity",
            &["severity"]
        )?,
        maintenance_duration: register_histogram_vec!(
            "mawaqit_maintenance_duration_seconds",
            "Maintenance task duration in seconds",
            &["task"],
            vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
        )?,
    };

    SOURCE_METRICS.set(source).map_err(|_| "Source metrics already initialized")?;
    SERVICE_METRICS.set(service).map_err(|_| "Service metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SOURCE_METRICS.get().is_some() && SERVICE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a source request outcome (`success`, `failure`, `invalid`)
pub fn record_source_request(source: &str, outcome: &str) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.requests.with_label_values(&[source, outcome]).inc();
    }
}

pub fn observe_source_latency(source: &str, secs: f64) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.latency.with_label_values(&[source]).observe(secs);
    }
}

pub fn set_circuit_state(source: &str, state: CircuitState) {
    let Some(m) = SOURCE_METRICS.get() else {
        return;
    };

    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    m.circuit_state.with_label_values(&[source]).set(value);
}

pub fn record_circuit_trip(source: &str) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.circuit_trips.with_label_values(&[source]).inc();
    }
}

pub fn record_cache_lookup(hit: bool) {
    if let Some(m) = SERVICE_METRICS.get() {
        let result = if hit { "hit" } else { "miss" };
        m.cache_lookups.with_label_values(&[result]).inc();
    }
}

pub fn set_cache_entries(entries: usize) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.cache_entries.set(entries as f64);
    }
}

pub fn record_stale_schedule() {
    if let Some(m) = SERVICE_METRICS.get() {
        m.stale_schedules.inc();
    }
}

/// Record an event outcome (`delivered`, `failed`, `duplicate`, `overdue`)
pub fn record_dispatch(class: &str, outcome: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.dispatched.with_label_values(&[class, outcome]).inc();
    }
}

pub fn set_active_groups(count: usize) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.active_groups.set(count as f64);
    }
}

pub fn record_error(category: &str, severity: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.errors.with_label_values(&[category, severity]).inc();
    }
}

pub fn record_alert(severity: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.alerts.with_label_values(&[severity]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Time a maintenance task until the guard drops
pub fn start_task_timer(task: &str) -> MetricsTimer {
    match SERVICE_METRICS.get() {
        Some(m) => MetricsTimer::new(m.maintenance_duration.with_label_values(&[task]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
