//! Shared fixtures for orchestration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use session_relay::{RunConfig, SessionDriver, SessionError, SessionIdentity, Task, TaskOutcome, TaskResult};

/// In-memory driver whose behavior is keyed by identity endpoint and task id.
///
/// - an identity with a quota serves that many successes, then reports
///   `ResourceExhausted` for every further call
/// - tasks listed as flaky always fail recoverably
/// - identities listed as broken fail `initialize`, identities listed as
///   crashing fail every `process` call with a fatal session error
/// - a task registered with `with_remove_on` deletes the given file before
///   succeeding, so persisting its result fails
#[derive(Default)]
pub struct QuotaDriver {
    quotas: Mutex<HashMap<String, usize>>,
    flaky: HashSet<String>,
    broken: HashSet<String>,
    crashing: HashSet<String>,
    delay: Duration,
    remove_on: Option<(String, PathBuf)>,
    attempts: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(String, String)>>,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
}

impl QuotaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(self, endpoint: &str, successes: usize) -> Self {
        self.quotas
            .lock()
            .expect("lock")
            .insert(endpoint.to_string(), successes);
        self
    }

    pub fn with_flaky(mut self, task_id: &str) -> Self {
        self.flaky.insert(task_id.to_string());
        self
    }

    pub fn with_broken(mut self, endpoint: &str) -> Self {
        self.broken.insert(endpoint.to_string());
        self
    }

    pub fn with_crashing(mut self, endpoint: &str) -> Self {
        self.crashing.insert(endpoint.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_remove_on(mut self, task_id: &str, path: impl Into<PathBuf>) -> Self {
        self.remove_on = Some((task_id.to_string(), path.into()));
        self
    }

    /// Number of `process` calls made for `task_id`.
    pub fn attempts(&self, task_id: &str) -> usize {
        self.attempts
            .lock()
            .expect("lock")
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    /// Every `process` call as `(endpoint, task id)`, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionDriver for QuotaDriver {
    type Handle = SessionIdentity;

    async fn initialize(&self, identity: &SessionIdentity) -> Result<SessionIdentity, SessionError> {
        if self.broken.contains(&identity.endpoint) {
            return Err(SessionError::Unavailable(format!(
                "cannot open {}",
                identity.endpoint
            )));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(identity.clone())
    }

    async fn process(
        &self,
        task: &Task,
        session: &mut SessionIdentity,
    ) -> Result<TaskOutcome, SessionError> {
        *self
            .attempts
            .lock()
            .expect("lock")
            .entry(task.id.clone())
            .or_insert(0) += 1;
        self.calls
            .lock()
            .expect("lock")
            .push((session.endpoint.clone(), task.id.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.crashing.contains(&session.endpoint) {
            return Err(SessionError::Fatal("session crashed".to_string()));
        }
        if self.flaky.contains(&task.id) {
            return Ok(TaskOutcome::RecoverableFailure("flaky".to_string()));
        }
        if let Some((ref id, ref path)) = self.remove_on {
            if *id == task.id {
                tokio::fs::remove_file(path).await.expect("remove output file");
            }
        }

        let mut quotas = self.quotas.lock().expect("lock");
        if let Some(left) = quotas.get_mut(&session.endpoint) {
            if *left == 0 {
                return Ok(TaskOutcome::ResourceExhausted);
            }
            *left -= 1;
        }
        Ok(TaskOutcome::Success(format!("answer to {}", task.text)))
    }

    async fn shutdown(&self, _session: SessionIdentity) {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configuration with millisecond-scale timings writing into `dir`.
pub fn fast_config(dir: &Path, identities: &[&str]) -> RunConfig {
    RunConfig::new()
        .with_identities(identities.iter().copied())
        .with_output_path(dir.join("out.json"))
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_inter_task_delay(Duration::ZERO)
        .with_sync_writes(false)
        .with_backups(false, 5)
}

pub fn tasks(ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(*id, format!("prompt {}", id)))
        .collect()
}

pub fn output_path(dir: &Path) -> PathBuf {
    dir.join("out.json")
}

/// Parses the result file, failing the test if it is not a valid array.
pub async fn read_output(path: &Path) -> Vec<TaskResult> {
    let content = tokio::fs::read_to_string(path).await.expect("read output");
    serde_json::from_str(&content).expect("output should be a valid JSON array")
}

pub async fn sorted_keys(path: &Path) -> Vec<String> {
    let mut keys: Vec<String> = read_output(path).await.into_iter().map(|r| r.key).collect();
    keys.sort();
    keys
}
