//! Run orchestrator.
//!
//! The `Orchestrator` wires the queue, the result store and the session
//! driver together and runs the generation loop:
//!
//! ```text
//! Start(tasks) ─► CohortRunning ─┬─ queue drained ─────────────► Terminal
//!                     ▲          ├─ identity exhausted ─┐
//!                     │          └─ cohort collapsed ───┤
//!                     │                                 ▼
//!                     └──────────── SwitchingIdentity (next identity)
//! ```
//!
//! Each generation binds a fresh cohort of `min(max_workers, queued + slack)`
//! workers to one session identity and a freshly minted
//! [`GenerationSignal`]. The orchestrator waits for whichever comes first:
//! the queue's quiescence barrier, the exhaustion signal, or every worker
//! having exited. It then stops the cohort and awaits every worker before
//! the next identity is touched, so no worker from an old generation ever
//! overlaps with a new one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::config::RunConfig;
use super::progress::{ProgressCounters, ProgressMonitor};
use crate::error::RunError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{
    GenerationSignal, RateLimiter, Task, TaskQueue, Worker, WorkerExit, WorkerReport, WorkerStats,
};
use crate::session::{SessionDriver, SessionIdentity};
use crate::storage::results::{ResultStore, StoreError};
use crate::storage::summary::{format_duration, write_summary, RunSummary};
use crate::storage::{backup, input};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task reached a final state.
    Completed,
    /// Work remains but every identity was consumed; some results exist.
    IdentitiesExhausted,
    /// Work remains and nothing was produced.
    Fatal,
}

impl RunStatus {
    /// Human-readable description for end-of-run reports.
    pub fn description(&self) -> &'static str {
        match self {
            RunStatus::Completed => "fully completed",
            RunStatus::IdentitiesExhausted => "partially completed, session identities exhausted",
            RunStatus::Fatal => "fatal, no results produced",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::IdentitiesExhausted => write!(f, "identities_exhausted"),
            RunStatus::Fatal => write!(f, "fatal"),
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationEnd {
    /// Every task was finalized.
    Drained,
    /// A worker reported the identity out of quota.
    Exhausted,
    /// Every worker exited with work left and no exhaustion signal.
    Collapsed,
    /// A result could not be persisted.
    StoreFailed,
}

impl GenerationEnd {
    pub fn label(&self) -> &'static str {
        match self {
            GenerationEnd::Drained => "drained",
            GenerationEnd::Exhausted => "exhausted",
            GenerationEnd::Collapsed => "collapsed",
            GenerationEnd::StoreFailed => "store_failed",
        }
    }
}

/// Statistics of one cohort generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub index: usize,
    pub identity: SessionIdentity,
    pub cohort_size: usize,
    pub end: GenerationEnd,
    pub completed: u64,
    pub failed: u64,
    /// Workers that ended because their session broke.
    pub session_failures: usize,
    pub duration: Duration,
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Tasks handed to the run, including skipped ones.
    pub total: usize,
    /// Tasks skipped because their key was already recorded.
    pub skipped: usize,
    pub completed: u64,
    pub failed: u64,
    pub failed_task_ids: Vec<String>,
    /// Tasks still queued when the run ended.
    pub pending_task_ids: Vec<String>,
    /// Per-slot statistics aggregated across generations.
    pub worker_stats: Vec<WorkerStats>,
    pub generations: Vec<GenerationReport>,
    /// Results in the output file at the end of the run.
    pub results_recorded: usize,
    pub total_duration: Duration,
    pub status: RunStatus,
}

impl RunReport {
    /// Tasks scheduled in this run (total minus skipped).
    pub fn scheduled(&self) -> usize {
        self.total - self.skipped
    }

    pub fn pending(&self) -> usize {
        self.pending_task_ids.len()
    }

    /// Number of session identities a cohort was started for.
    pub fn identities_consumed(&self) -> usize {
        self.generations.len()
    }

    /// Driver time summed over every worker, in seconds.
    pub fn total_processing_time_secs(&self) -> f64 {
        self.worker_stats
            .iter()
            .map(|s| s.total_processing_time_secs)
            .sum()
    }

    /// Percentage of scheduled tasks that succeeded.
    pub fn success_rate(&self) -> f64 {
        let scheduled = self.scheduled();
        if scheduled == 0 {
            return 0.0;
        }
        self.completed as f64 / scheduled as f64 * 100.0
    }

    /// Mean driver time per successful task, in seconds.
    pub fn average_processing_time(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.total_processing_time_secs() / self.completed as f64
    }

    /// Builds the persisted summary.
    pub fn summary(&self) -> RunSummary {
        let total_duration = self.total_duration.as_secs_f64();
        RunSummary {
            run_id: self.run_id.to_string(),
            status: self.status,
            total: self.total,
            successful: self.completed,
            failed: self.failed,
            pending: self.pending(),
            skipped: self.skipped,
            success_rate: self.success_rate(),
            average_processing_time: self.average_processing_time(),
            total_processing_time: self.total_processing_time_secs(),
            total_duration,
            formatted_duration: format_duration(total_duration),
            identities_consumed: self.identities_consumed(),
            workers_used: self.worker_stats.len(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            failed_task_ids: self.failed_task_ids.clone(),
            pending_task_ids: self.pending_task_ids.clone(),
            workers: self.worker_stats.clone(),
        }
    }
}

/// Coordinates cohorts of session workers over a rotating set of identities.
pub struct Orchestrator<D: SessionDriver> {
    config: RunConfig,
    driver: Arc<D>,
    metrics: MetricsCollector,
}

impl<D: SessionDriver> Orchestrator<D> {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `RunError::NoIdentities` if no identity is configured and
    /// `RunError::Config` if the configuration is otherwise invalid.
    pub fn new(config: RunConfig, driver: D) -> Result<Self, RunError> {
        Self::with_shared_driver(config, Arc::new(driver))
    }

    /// Creates an orchestrator around a driver the caller keeps a handle to.
    pub fn with_shared_driver(config: RunConfig, driver: Arc<D>) -> Result<Self, RunError> {
        if config.identities.is_empty() {
            return Err(RunError::NoIdentities);
        }
        config.validate()?;

        Ok(Self {
            config,
            driver,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Loads tasks from `path` and runs them.
    pub async fn run_from_file(&self, path: impl AsRef<Path>) -> Result<RunReport, RunError> {
        let loaded = input::load_tasks(path, self.config.max_retries).await?;
        self.run(loaded.tasks).await
    }

    /// Runs `tasks` to completion or until every identity is consumed.
    ///
    /// Tasks whose id is already recorded in the output file are skipped.
    /// Each task keeps its own retry budget.
    ///
    /// # Errors
    ///
    /// Returns `RunError::Store` if the result file cannot be opened or a
    /// result cannot be persisted. Per-task failures are never errors here.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let output_path = &self.config.output_path;

        if self.config.backup_output {
            backup::backup_output(output_path, self.config.max_backups).await;
        }

        let store = Arc::new(ResultStore::open(output_path, self.config.sync_writes).await?);

        let total = tasks.len();
        let (todo, done): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|t| !store.resume_set().contains(&t.id));
        let skipped = done.len();

        info!(
            run_id = %run_id,
            total = total,
            skipped = skipped,
            scheduled = todo.len(),
            identities = self.config.identities.len(),
            output = %output_path.display(),
            "Starting run"
        );

        let queue = Arc::new(TaskQueue::new());
        queue.enqueue_batch(todo);
        self.metrics.update_queue_depth(queue.len());

        let progress = ProgressCounters::new();
        let monitor = self.config.progress_interval.map(|interval| {
            ProgressMonitor::start(progress.clone(), Arc::clone(&queue), queue.len(), interval)
        });

        let identities = SessionIdentity::from_endpoints(self.config.identities.iter().cloned());
        let identity_count = identities.len();
        let mut slots: BTreeMap<usize, WorkerStats> = BTreeMap::new();
        let mut generations: Vec<GenerationReport> = Vec::new();
        let mut store_error: Option<StoreError> = None;

        for identity in identities {
            if queue.unfinished() == 0 {
                break;
            }

            let index = generations.len();
            let (report, reports) = self
                .run_generation(index, identity, &queue, &store, &progress)
                .await;

            for worker in reports {
                slots
                    .entry(worker.stats.worker_id)
                    .or_insert_with(|| WorkerStats::new(worker.stats.worker_id))
                    .merge(&worker.stats);
                if let WorkerExit::StoreFailed(e) = worker.exit {
                    if store_error.is_none() {
                        store_error = Some(e);
                    }
                }
            }

            let end = report.end;
            generations.push(report);

            match end {
                GenerationEnd::Drained | GenerationEnd::StoreFailed => break,
                GenerationEnd::Exhausted | GenerationEnd::Collapsed => {
                    if index + 1 < identity_count {
                        self.metrics.record_identity_rotation(end.label());
                        warn!(
                            generation = index,
                            reason = end.label(),
                            remaining = queue.unfinished(),
                            "Advancing to next session identity"
                        );
                    }
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        if let Some(e) = store_error {
            error!(run_id = %run_id, error = %e, "Run aborted: result could not be persisted");
            return Err(RunError::Store(e));
        }

        let mut pending_task_ids = Vec::new();
        while let Some(task) = queue.try_dequeue() {
            pending_task_ids.push(task.id);
        }
        self.metrics.update_queue_depth(0);

        let worker_stats: Vec<WorkerStats> = slots.into_values().collect();
        let completed = worker_stats.iter().map(|s| s.completed).sum();
        let failed = worker_stats.iter().map(|s| s.failed).sum();
        let failed_task_ids = worker_stats
            .iter()
            .flat_map(|s| s.failed_task_ids.iter().cloned())
            .collect();
        let results_recorded = store.len().await;

        let status = if pending_task_ids.is_empty() {
            RunStatus::Completed
        } else if results_recorded > 0 {
            RunStatus::IdentitiesExhausted
        } else {
            RunStatus::Fatal
        };

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total,
            skipped,
            completed,
            failed,
            failed_task_ids,
            pending_task_ids,
            worker_stats,
            generations,
            results_recorded,
            total_duration: clock.elapsed(),
            status,
        };

        match status {
            RunStatus::Completed => info!(
                run_id = %run_id,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                identities_consumed = report.identities_consumed(),
                "Run {}",
                status.description()
            ),
            _ => warn!(
                run_id = %run_id,
                completed = report.completed,
                failed = report.failed,
                pending = report.pending(),
                identities_consumed = report.identities_consumed(),
                "Run {}",
                status.description()
            ),
        }

        let summary_path = self.config.resolved_summary_path();
        if let Err(e) = write_summary(&summary_path, &report.summary()).await {
            warn!(path = %summary_path.display(), error = %e, "Failed to save run summary");
        }

        Ok(report)
    }

    /// Runs one cohort bound to `identity` until it drains, is exhausted
    /// or collapses, and returns once every worker has terminated.
    async fn run_generation(
        &self,
        index: usize,
        identity: SessionIdentity,
        queue: &Arc<TaskQueue>,
        store: &Arc<ResultStore>,
        progress: &ProgressCounters,
    ) -> (GenerationReport, Vec<WorkerReport>) {
        let signal = GenerationSignal::new(index);
        let cohort_size = self
            .config
            .max_workers
            .min(queue.len() + self.config.cohort_slack)
            .max(1);
        let limiter = self
            .config
            .requests_per_minute
            .map(|rpm| Arc::new(RateLimiter::new(rpm)));
        let started = Instant::now();

        info!(
            generation = index,
            identity = %identity,
            cohort_size = cohort_size,
            queued = queue.len(),
            "Starting cohort"
        );

        let handles: Vec<_> = (0..cohort_size)
            .map(|slot| {
                let worker = Worker::new(
                    slot,
                    identity.clone(),
                    Arc::clone(&self.driver),
                    Arc::clone(queue),
                    Arc::clone(store),
                    signal.clone(),
                    self.config.worker_config(),
                )
                .with_rate_limiter(limiter.clone())
                .with_progress(progress.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        let cohort = futures::future::join_all(handles);
        tokio::pin!(cohort);

        // Drained vs exhausted vs every worker gone, whichever comes first.
        let finished = tokio::select! {
            biased;
            _ = signal.exhausted() => None,
            _ = queue.join() => None,
            results = cohort.as_mut() => Some(results),
        };
        let results = match finished {
            Some(results) => results,
            None => {
                signal.request_shutdown();
                cohort.as_mut().await
            }
        };

        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                // A panicking worker's lease hands its task back on unwind.
                Err(e) => error!(generation = index, error = %e, "Worker task panicked"),
            }
        }

        let store_failed = reports
            .iter()
            .any(|r| matches!(r.exit, WorkerExit::StoreFailed(_)));
        let end = if store_failed {
            GenerationEnd::StoreFailed
        } else if signal.is_exhausted() {
            GenerationEnd::Exhausted
        } else if queue.unfinished() == 0 {
            GenerationEnd::Drained
        } else {
            GenerationEnd::Collapsed
        };

        let report = GenerationReport {
            index,
            cohort_size,
            end,
            completed: reports.iter().map(|r| r.stats.completed).sum(),
            failed: reports.iter().map(|r| r.stats.failed).sum(),
            session_failures: reports
                .iter()
                .filter(|r| matches!(r.exit, WorkerExit::SessionFatal(_)))
                .count(),
            duration: started.elapsed(),
            identity,
        };

        info!(
            generation = index,
            identity = %report.identity,
            end = end.label(),
            completed = report.completed,
            failed = report.failed,
            session_failures = report.session_failures,
            remaining = queue.unfinished(),
            duration_secs = report.duration.as_secs_f64(),
            "Cohort finished"
        );

        (report, reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus) -> RunReport {
        let mut worker = WorkerStats::new(0);
        worker.completed = 3;
        worker.failed = 1;
        worker.total_processing_time_secs = 6.0;
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 6,
            skipped: 1,
            completed: 3,
            failed: 1,
            failed_task_ids: vec!["d".to_string()],
            pending_task_ids: vec!["e".to_string()],
            worker_stats: vec![worker],
            generations: Vec::new(),
            results_recorded: 4,
            total_duration: Duration::from_secs(90),
            status,
        }
    }

    #[test]
    fn test_report_rates() {
        let report = report(RunStatus::IdentitiesExhausted);
        assert_eq!(report.scheduled(), 5);
        assert_eq!(report.pending(), 1);
        assert!((report.success_rate() - 60.0).abs() < 1e-9);
        assert!((report.average_processing_time() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_from_report() {
        let summary = report(RunStatus::IdentitiesExhausted).summary();
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.formatted_duration, "1.50m");
        assert_eq!(summary.workers_used, 1);
        assert_eq!(summary.status, RunStatus::IdentitiesExhausted);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Completed.to_string(), "completed");
        assert_eq!(RunStatus::IdentitiesExhausted.to_string(), "identities_exhausted");
        assert_eq!(RunStatus::Fatal.to_string(), "fatal");
        assert!(RunStatus::Fatal.description().contains("no results"));
    }

    #[test]
    fn test_new_rejects_missing_identities() {
        let result = Orchestrator::new(RunConfig::new(), crate::session::HttpDriver::new());
        assert!(matches!(result, Err(RunError::NoIdentities)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RunConfig::new().with_identities(["a"]).with_max_workers(0);
        let result = Orchestrator::new(config, crate::session::HttpDriver::new());
        assert!(matches!(result, Err(RunError::Config(_))));
    }
}
