//! Task definitions for the scheduler.
//!
//! This module defines the core types that flow through the scheduling system:
//!
//! - `Task`: A unit of work owned by exactly one worker at a time
//! - `TaskStatus`: Lifecycle state of a task
//! - `TaskResult`: The `{key, value}` record produced by a successful task

use serde::{Deserialize, Serialize};

/// Default number of retries granted to a task after its first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Held by a worker.
    InProgress,
    /// A result has been recorded.
    Completed,
    /// Retries are exhausted; the task is dropped permanently.
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A textual task to be run against a session.
///
/// `retry_count` never exceeds `max_retries`: once the budget is spent the
/// task moves to [`TaskStatus::Failed`] and stays there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique, non-empty identifier. Becomes the `key` of the result.
    pub id: String,
    /// The prompt text handed to the session driver.
    pub text: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Number of recoverable failures charged so far.
    pub retry_count: u32,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
}

impl Task {
    /// Creates a pending task with the default retry budget.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns whether another recoverable failure can be retried.
    pub fn can_retry(&self) -> bool {
        self.status != TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Returns the number of retries left.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Marks the task as held by a worker.
    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    /// Marks the task as completed.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
    }

    /// Charges one recoverable failure against the retry budget.
    ///
    /// Returns `true` if the task goes back to `Pending` for another attempt,
    /// `false` if the budget was already spent and the task is now `Failed`.
    pub fn charge_failure(&mut self) -> bool {
        if self.can_retry() {
            self.retry_count += 1;
            self.status = TaskStatus::Pending;
            true
        } else {
            self.status = TaskStatus::Failed;
            false
        }
    }

    /// Releases the task back to `Pending` without touching the retry budget.
    ///
    /// Used when the failure is not the task's fault (exhausted or broken session).
    pub fn release(&mut self) {
        self.status = TaskStatus::Pending;
    }

    /// Returns whether the task reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A successful result, persisted as `{"key": ..., "value": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    /// The id of the task that produced this result.
    pub key: String,
    /// The produced text.
    pub value: String,
}

impl TaskResult {
    /// Creates a new result record.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("a", "hello");
        assert_eq!(task.id, "a");
        assert_eq!(task.text, "hello");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.can_retry());
    }

    #[test]
    fn test_charge_failure_respects_budget() {
        let mut task = Task::new("a", "x").with_max_retries(2);

        assert!(task.charge_failure());
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(task.charge_failure());
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.remaining_retries(), 0);

        assert!(!task.charge_failure());
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.is_terminal());

        // Failed is permanent.
        assert!(!task.charge_failure());
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_zero_retries_fails_on_first_charge() {
        let mut task = Task::new("a", "x").with_max_retries(0);
        assert!(!task.can_retry());
        assert!(!task.charge_failure());
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_release_keeps_retry_count() {
        let mut task = Task::new("a", "x");
        task.charge_failure();
        task.mark_in_progress();
        task.release();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_task_result_serializes_as_key_value() {
        let result = TaskResult::new("k", "v");
        let json = serde_json::to_value(&result).expect("result should serialize");
        assert_eq!(json, serde_json::json!({"key": "k", "value": "v"}));
    }
}
