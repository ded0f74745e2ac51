//! High-level metric recording for relay runs.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so the scheduler and
//! orchestrator never touch label values directly. Every method is a no-op
//! until `init_metrics()` has been called, so library users that do not
//! want metrics pay nothing.

use super::prometheus::{
    ACTIVE_WORKERS, IDENTITY_ROTATIONS, QUEUE_DEPTH, RESULTS_WRITTEN, TASKS_IN_PROGRESS,
    TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording relay operational metrics.
///
/// # Example
///
/// ```ignore
/// use session_relay::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("success", 12.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one driver call.
    ///
    /// # Arguments
    ///
    /// * `outcome` - Outcome label (`success`, `recoverable_failure`,
    ///   `resource_exhausted`, `session_fatal`, `timeout`)
    /// * `duration_secs` - Call duration in seconds
    pub fn record_task(&self, outcome: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Update the number of tasks waiting in the queue.
    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }

    pub fn inc_tasks_in_progress(&self) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn dec_tasks_in_progress(&self) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }

    /// Record a switch to the next session identity.
    ///
    /// # Arguments
    ///
    /// * `reason` - Why the previous cohort ended (`exhausted`, `collapsed`)
    pub fn record_identity_rotation(&self, reason: &str) {
        if let Some(rotations) = IDENTITY_ROTATIONS.get() {
            rotations.with_label_values(&[reason]).inc();
        }

        tracing::trace!(reason = reason, "Recorded identity rotation metric");
    }

    /// Record one durable result append.
    pub fn record_result_written(&self) {
        if let Some(counter) = RESULTS_WRITTEN.get() {
            counter.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_task() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        let before = TASKS_TOTAL
            .get()
            .map(|m| m.with_label_values(&["timeout"]).get())
            .unwrap_or(0.0);
        collector.record_task("timeout", 1.5);
        let after = TASKS_TOTAL
            .get()
            .map(|m| m.with_label_values(&["timeout"]).get())
            .unwrap_or(0.0);

        assert!(TASKS_TOTAL.get().is_none() || after > before);
    }

    #[test]
    fn test_identity_rotation() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.record_identity_rotation("exhausted");

        if let Some(rotations) = IDENTITY_ROTATIONS.get() {
            assert!(rotations.with_label_values(&["exhausted"]).get() >= 1.0);
        }
    }

    #[test]
    fn test_gauges_do_not_panic() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.update_queue_depth(7);
        collector.inc_active_workers();
        collector.dec_active_workers();
        collector.inc_tasks_in_progress();
        collector.dec_tasks_in_progress();
        collector.record_result_written();
    }
}
