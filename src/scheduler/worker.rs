//! Session worker.
//!
//! A worker owns exactly one external session for the lifetime of its
//! cohort and runs tasks through it strictly one at a time. For every task
//! it pulls from the queue it classifies the driver outcome and finalizes
//! the task lease accordingly:
//!
//! | Outcome | Action |
//! |---|---|
//! | `Success` | append `{key, value}` to the store, finish the lease |
//! | `RecoverableFailure` | charge the retry budget, back off, requeue at tail; or drop as failed |
//! | `ResourceExhausted` | requeue unchanged, raise the cohort signal, exit |
//! | `SessionError` | requeue unchanged, exit |
//!
//! Every dequeued task is finalized before the worker moves on or exits,
//! so the queue's quiescence barrier stays accurate.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::job::TaskResult;
use super::queue::{TaskLease, TaskQueue};
use super::rate_limiter::RateLimiter;
use super::signal::GenerationSignal;
use crate::error::SessionError;
use crate::metrics::MetricsCollector;
use crate::pipeline::progress::ProgressCounters;
use crate::session::{SessionDriver, SessionIdentity, TaskOutcome};
use crate::storage::results::{ResultStore, StoreError};

/// Timing knobs shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one queue poll waits for a task.
    pub poll_interval: Duration,
    /// Backoff before the first retry.
    pub retry_backoff_base: Duration,
    /// Upper bound for any single backoff.
    pub retry_backoff_max: Duration,
    /// Pause between two consecutive tasks on the same session.
    pub inter_task_delay: Duration,
    /// Optional limit on one driver call; expiry counts as a recoverable failure.
    pub task_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
            inter_task_delay: Duration::from_secs(1),
            task_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// Returns the delay before retrying a task that has already been
    /// retried `retry_count` times: `base * 2^retry_count`, capped.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.retry_backoff_max)
            .min(self.retry_backoff_max)
    }
}

/// Per-slot counters, owned by one worker and read only after it stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_id: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_processing_time_secs: f64,
    /// Ids of tasks dropped after exhausting their retries.
    pub failed_task_ids: Vec<String>,
}

impl WorkerStats {
    /// Creates empty stats for a worker slot.
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    /// Folds the counters of a later generation into this slot.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.total_processing_time_secs += other.total_processing_time_secs;
        self.failed_task_ids
            .extend(other.failed_task_ids.iter().cloned());
    }

    /// Returns completed + failed.
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Why a worker left its loop.
#[derive(Debug)]
pub enum WorkerExit {
    /// Nothing left to do.
    Idle,
    /// The generation signal asked it to stop.
    Stopped,
    /// It observed the session identity run out of quota.
    Exhausted,
    /// Its session became unusable.
    SessionFatal(SessionError),
    /// A result could not be persisted.
    StoreFailed(StoreError),
}

impl WorkerExit {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerExit::Idle => "idle",
            WorkerExit::Stopped => "stopped",
            WorkerExit::Exhausted => "exhausted",
            WorkerExit::SessionFatal(_) => "session_fatal",
            WorkerExit::StoreFailed(_) => "store_failed",
        }
    }
}

/// Final state handed back to the orchestrator when a worker stops.
#[derive(Debug)]
pub struct WorkerReport {
    pub stats: WorkerStats,
    pub exit: WorkerExit,
}

/// A single worker bound to one session identity for one generation.
pub struct Worker<D: SessionDriver> {
    id: usize,
    identity: SessionIdentity,
    driver: Arc<D>,
    queue: Arc<TaskQueue>,
    store: Arc<ResultStore>,
    signal: GenerationSignal,
    config: WorkerConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics: MetricsCollector,
    progress: ProgressCounters,
    stats: WorkerStats,
}

impl<D: SessionDriver> Worker<D> {
    /// Creates a new worker.
    ///
    /// # Arguments
    ///
    /// * `id` - Worker slot index, stable across generations
    /// * `identity` - Session identity of the current generation
    /// * `driver` - Session driver shared by the cohort
    /// * `queue` - Shared task queue
    /// * `store` - Shared result store
    /// * `signal` - Signal of the current generation
    /// * `config` - Timing configuration
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        identity: SessionIdentity,
        driver: Arc<D>,
        queue: Arc<TaskQueue>,
        store: Arc<ResultStore>,
        signal: GenerationSignal,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            identity,
            driver,
            queue,
            store,
            signal,
            config,
            rate_limiter: None,
            metrics: MetricsCollector::new(),
            progress: ProgressCounters::new(),
            stats: WorkerStats::new(id),
        }
    }

    /// Paces driver calls through a limiter shared with the rest of the cohort.
    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Reports progress into counters shared with a [`crate::pipeline::ProgressMonitor`].
    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = progress;
        self
    }

    /// Main worker loop.
    ///
    /// Opens the session, processes tasks until there is nothing left or the
    /// generation signal fires, then closes the session.
    pub async fn run(mut self) -> WorkerReport {
        info!(
            worker_id = self.id,
            generation = self.signal.generation(),
            identity = %self.identity,
            "Worker started"
        );
        self.metrics.inc_active_workers();

        let exit = match self.driver.initialize(&self.identity).await {
            Ok(mut session) => {
                let exit = self.process_loop(&mut session).await;
                self.driver.shutdown(session).await;
                exit
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    identity = %self.identity,
                    error = %e,
                    "Failed to initialize session"
                );
                WorkerExit::SessionFatal(e)
            }
        };

        self.metrics.dec_active_workers();
        info!(
            worker_id = self.id,
            generation = self.signal.generation(),
            exit = exit.label(),
            completed = self.stats.completed,
            failed = self.stats.failed,
            "Worker stopped"
        );

        WorkerReport {
            stats: self.stats,
            exit,
        }
    }

    async fn process_loop(&mut self, session: &mut D::Handle) -> WorkerExit {
        loop {
            if self.signal.should_stop() {
                return WorkerExit::Stopped;
            }

            let lease = tokio::select! {
                biased;
                _ = self.signal.stopped() => return WorkerExit::Stopped,
                lease = self.queue.lease(self.config.poll_interval) => lease,
            };

            let Some(lease) = lease else {
                if self.queue.unfinished() == 0 {
                    debug!(worker_id = self.id, "Queue drained");
                    return WorkerExit::Idle;
                }
                // Other workers still hold tasks that may come back.
                continue;
            };

            self.metrics.update_queue_depth(self.queue.len());
            if let Some(exit) = self.process_task(lease, session).await {
                return exit;
            }

            if !self.config.inter_task_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_task_delay) => {}
                    _ = self.signal.stopped() => {}
                }
            }
        }
    }

    /// Runs one task and finalizes its lease. Returns `Some` if the worker
    /// must stop.
    async fn process_task(
        &mut self,
        mut lease: TaskLease,
        session: &mut D::Handle,
    ) -> Option<WorkerExit> {
        let task_id = lease.task().id.clone();

        // A stop while waiting for a token hands the task back untouched.
        if let Some(ref limiter) = self.rate_limiter {
            let acquired = tokio::select! {
                biased;
                _ = self.signal.stopped() => false,
                _ = limiter.acquire() => true,
            };
            if !acquired {
                debug!(worker_id = self.id, task_id = %task_id, "Stopped while rate limited");
                lease.requeue();
                return Some(WorkerExit::Stopped);
            }
        }

        lease.task_mut().mark_in_progress();

        debug!(
            worker_id = self.id,
            task_id = %task_id,
            retry_count = lease.task().retry_count,
            "Processing task"
        );

        self.metrics.inc_tasks_in_progress();
        self.progress.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let (outcome, label) = match self.config.task_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.driver.process(lease.task(), session)).await
                {
                    Ok(outcome) => {
                        let label = outcome_label(&outcome);
                        (outcome, label)
                    }
                    Err(_) => (
                        Ok(TaskOutcome::RecoverableFailure(format!(
                            "timed out after {:?}",
                            limit
                        ))),
                        "timeout",
                    ),
                }
            }
            None => {
                let outcome = self.driver.process(lease.task(), session).await;
                let label = outcome_label(&outcome);
                (outcome, label)
            }
        };
        let elapsed = started.elapsed();
        self.metrics.dec_tasks_in_progress();
        self.progress.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record_task(label, elapsed.as_secs_f64());
        self.stats.total_processing_time_secs += elapsed.as_secs_f64();

        match outcome {
            Ok(TaskOutcome::Success(text)) => self.on_success(lease, text, elapsed).await,
            Ok(TaskOutcome::RecoverableFailure(reason)) => {
                self.on_recoverable_failure(lease, &reason).await;
                None
            }
            Ok(TaskOutcome::ResourceExhausted) => {
                lease.task_mut().release();
                lease.requeue();
                self.progress.exhausted.fetch_add(1, Ordering::Relaxed);
                if self.signal.raise_exhausted() {
                    warn!(
                        worker_id = self.id,
                        task_id = %task_id,
                        identity = %self.identity,
                        "Session identity exhausted, stopping cohort"
                    );
                } else {
                    debug!(worker_id = self.id, task_id = %task_id, "Exhaustion already signalled");
                }
                Some(WorkerExit::Exhausted)
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %task_id,
                    identity = %self.identity,
                    error = %e,
                    "Session failed, worker terminating"
                );
                lease.task_mut().release();
                lease.requeue();
                Some(WorkerExit::SessionFatal(e))
            }
        }
    }

    async fn on_success(
        &mut self,
        mut lease: TaskLease,
        text: String,
        elapsed: Duration,
    ) -> Option<WorkerExit> {
        let result = TaskResult::new(lease.task().id.clone(), text);

        match self.store.append(&result).await {
            Ok(written) => {
                if written {
                    self.metrics.record_result_written();
                } else {
                    debug!(worker_id = self.id, task_id = %result.key, "Result was already recorded");
                }
                lease.task_mut().mark_completed();
                lease.finish();
                self.stats.completed += 1;
                self.progress.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker_id = self.id,
                    task_id = %result.key,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                None
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %result.key,
                    error = %e,
                    "Failed to persist result"
                );
                lease.task_mut().release();
                lease.requeue();
                self.signal.request_shutdown();
                Some(WorkerExit::StoreFailed(e))
            }
        }
    }

    async fn on_recoverable_failure(&mut self, mut lease: TaskLease, reason: &str) {
        let retry_count = lease.task().retry_count;

        if lease.task_mut().charge_failure() {
            let delay = self.config.backoff_for(retry_count);
            warn!(
                worker_id = self.id,
                task_id = %lease.task().id,
                attempt = retry_count + 1,
                remaining_retries = lease.task().remaining_retries(),
                delay_ms = delay.as_millis() as u64,
                reason = reason,
                "Task failed, retrying"
            );

            // Cut the backoff short if the cohort is stopping; the task is
            // requeued either way.
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.signal.stopped() => {}
            }
            lease.requeue();
            self.progress.retried.fetch_add(1, Ordering::Relaxed);
        } else {
            let task = lease.finish();
            warn!(
                worker_id = self.id,
                task_id = %task.id,
                attempts = task.retry_count + 1,
                reason = reason,
                "Task failed permanently"
            );
            self.stats.failed += 1;
            self.progress.failed.fetch_add(1, Ordering::Relaxed);
            self.stats.failed_task_ids.push(task.id);
        }
    }
}

fn outcome_label(outcome: &Result<TaskOutcome, SessionError>) -> &'static str {
    match outcome {
        Ok(outcome) => outcome.label(),
        Err(_) => "session_fatal",
    }
}
