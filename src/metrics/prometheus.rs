//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by session-relay and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all session-relay metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of driver calls, labeled by outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Driver call duration in seconds.
pub static TASK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of tasks waiting in the queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of tasks currently held by a worker.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of live workers in the current cohort.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Session identity switches, labeled by the reason the previous cohort ended.
pub static IDENTITY_ROTATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Results durably appended to the result store.
pub static RESULTS_WRITTEN: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
///
/// # Example
///
/// ```ignore
/// use session_relay::metrics::init_metrics;
///
/// init_metrics().expect("Failed to initialize metrics");
/// ```
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("session_relay_tasks_total", "Total number of driver calls"),
        &["outcome"],
    )?;

    let task_duration = Histogram::with_opts(
        HistogramOpts::new(
            "session_relay_task_duration_seconds",
            "Driver call duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    let queue_depth = Gauge::new(
        "session_relay_queue_depth",
        "Number of tasks waiting in the queue",
    )?;

    let tasks_in_progress = Gauge::new(
        "session_relay_tasks_in_progress",
        "Number of tasks currently held by a worker",
    )?;

    let active_workers = Gauge::new(
        "session_relay_active_workers",
        "Number of live workers in the current cohort",
    )?;

    let identity_rotations = CounterVec::new(
        Opts::new(
            "session_relay_identity_rotations_total",
            "Session identity switches",
        ),
        &["reason"],
    )?;

    let results_written = Counter::new(
        "session_relay_results_written_total",
        "Results durably appended to the result store",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(identity_rotations.clone()))?;
    registry.register(Box::new(results_written.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = IDENTITY_ROTATIONS.set(identity_rotations);
    let _ = RESULTS_WRITTEN.set(results_written);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics snapshot to `path` in Prometheus text format.
///
/// Suitable for the node-exporter textfile collector.
pub async fn write_metrics_file(path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
    tokio::fs::write(path, export_metrics()).await
}
