//! Background progress monitor for relay runs.
//!
//! Periodically logs run statistics (completed, failed, requeued, in
//! flight, queue depth) so operators can follow long runs without parsing
//! per-task log lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::scheduler::TaskQueue;

/// Snapshot of run progress counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Tasks whose result was recorded.
    pub completed: usize,
    /// Tasks dropped after exhausting their retries.
    pub failed: usize,
    /// Recoverable failures sent back to the queue.
    pub retried: usize,
    /// Tasks handed back because a session identity ran out.
    pub exhausted: usize,
    /// Tasks currently inside a driver call.
    pub in_flight: usize,
    /// Wall-clock elapsed time since the monitor started.
    pub elapsed: Duration,
}

/// Shared atomic counters for run progress tracking.
///
/// Cloned into every worker and incremented via `fetch_add`. The background
/// monitor reads these periodically to emit progress logs.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub completed: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub retried: Arc<AtomicUsize>,
    pub exhausted: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    /// Create a new set of zeroed progress counters.
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            retried: Arc::new(AtomicUsize::new(0)),
            exhausted: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a background progress monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared atomic counters incremented by workers
    /// * `queue` - Task queue, read for depth and outstanding work
    /// * `total` - Number of tasks scheduled this run (used for percentage)
    /// * `interval` - How often to emit progress logs
    pub fn start(
        counters: ProgressCounters,
        queue: Arc<TaskQueue>,
        total: usize,
        interval: Duration,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let done = snap.completed + snap.failed;
                let pct = if total > 0 {
                    (done as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    100.0
                };

                let elapsed_secs = snap.elapsed.as_secs_f64();
                let completed_per_min = if elapsed_secs > 0.0 {
                    snap.completed as f64 * 60.0 / elapsed_secs
                } else {
                    0.0
                };

                tracing::info!(
                    completed = snap.completed,
                    failed = snap.failed,
                    retried = snap.retried,
                    exhausted = snap.exhausted,
                    in_flight = snap.in_flight,
                    queued = queue.len(),
                    outstanding = queue.unfinished(),
                    total = total,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    completed_per_min = format!("{:.2}", completed_per_min),
                    "Relay progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
