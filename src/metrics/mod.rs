//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks driver call outcomes, queue depth, cohort size and identity
//! rotations. The CLI can dump a snapshot to a file at the end of a run
//! (`--metrics-file`).
//!
//! # Example
//!
//! ```ignore
//! use session_relay::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("success", 3.2);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    ACTIVE_WORKERS, IDENTITY_ROTATIONS, QUEUE_DEPTH, REGISTRY, RESULTS_WRITTEN,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
