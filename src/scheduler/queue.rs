//! In-memory FIFO task queue with a quiescence barrier.
//!
//! The queue supports:
//!
//! - Non-blocking `enqueue` at the tail
//! - `dequeue` with a timeout, never blocking indefinitely
//! - `mark_done` / `join`: every dequeued task is finalized exactly once, and
//!   `join` resolves only when every enqueued task has been finalized
//!
//! # Accounting
//!
//! An `unfinished` counter is incremented by every `enqueue` and decremented
//! by every `mark_done`. A requeue is an `enqueue` of the held task followed
//! by a `mark_done` for the dequeue that produced it, so the counter never
//! drops to zero while a retry is pending. Requeued tasks go to the tail and
//! never overtake fresh ones.
//!
//! Workers should hold dequeued tasks through a [`TaskLease`], which puts the
//! task back on the queue if the holder goes away without finalizing it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{error, warn};

use super::job::Task;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `mark_done` was called more times than tasks were enqueued.
    #[error("mark_done called with no unfinished tasks")]
    DoneWithoutTask,
}

struct QueueState {
    tasks: VecDeque<Task>,
    unfinished: usize,
}

/// FIFO queue of pending tasks shared by the orchestrator and all workers.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    /// Wakes one waiting `dequeue` per enqueued task.
    available: Notify,
    /// Mirrors `QueueState::unfinished` for `join` waiters.
    unfinished_tx: watch::Sender<usize>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (unfinished_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                unfinished: 0,
            }),
            available: Notify::new(),
            unfinished_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a task to the tail of the queue.
    pub fn enqueue(&self, task: Task) {
        {
            let mut state = self.state();
            state.tasks.push_back(task);
            state.unfinished += 1;
            self.unfinished_tx.send_replace(state.unfinished);
        }
        self.available.notify_one();
    }

    /// Appends several tasks in order.
    pub fn enqueue_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.enqueue(task);
        }
    }

    /// Removes the head task if one is available right now.
    pub fn try_dequeue(&self) -> Option<Task> {
        self.state().tasks.pop_front()
    }

    /// Removes and returns the head task, waiting at most `timeout` for one
    /// to arrive.
    ///
    /// Returns `None` if the timeout expires with the queue still empty.
    /// Cancel-safe: a task is only removed in the poll that returns it.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        let wait = async {
            loop {
                let notified = self.available.notified();
                tokio::pin!(notified);
                // Register before checking so an enqueue in between is not missed.
                notified.as_mut().enable();

                if let Some(task) = self.try_dequeue() {
                    return task;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Dequeues a task wrapped in a [`TaskLease`].
    pub async fn lease(self: &Arc<Self>, timeout: Duration) -> Option<TaskLease> {
        self.dequeue(timeout)
            .await
            .map(|task| TaskLease::new(Arc::clone(self), task))
    }

    /// Records that processing of one dequeued task is finalized.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::DoneWithoutTask` if there is no unfinished task
    /// to account for.
    pub fn mark_done(&self) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.unfinished == 0 {
            return Err(QueueError::DoneWithoutTask);
        }
        state.unfinished -= 1;
        self.unfinished_tx.send_replace(state.unfinished);
        Ok(())
    }

    /// Waits until every enqueued task has been finalized with `mark_done`.
    ///
    /// Resolves immediately if nothing is outstanding.
    pub async fn join(&self) {
        let mut rx = self.unfinished_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|unfinished| *unfinished == 0).await;
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn len(&self) -> usize {
        self.state().tasks.len()
    }

    /// Returns whether no task is waiting in the queue.
    pub fn is_empty(&self) -> bool {
        self.state().tasks.is_empty()
    }

    /// Returns the number of tasks enqueued but not yet finalized.
    ///
    /// Includes both waiting tasks and tasks held by workers.
    pub fn unfinished(&self) -> usize {
        self.state().unfinished
    }

    /// Returns the ids of the waiting tasks, head first.
    pub fn pending_ids(&self) -> Vec<String> {
        self.state().tasks.iter().map(|t| t.id.clone()).collect()
    }
}

/// A dequeued task held by a worker.
///
/// The lease must be finalized with [`TaskLease::finish`] or
/// [`TaskLease::requeue`]. If it is dropped instead (for example because
/// the holder panicked) the task is released back to the tail of the queue,
/// so every dequeue is still matched by a `mark_done`.
pub struct TaskLease {
    queue: Arc<TaskQueue>,
    task: Option<Task>,
}

impl TaskLease {
    fn new(queue: Arc<TaskQueue>, task: Task) -> Self {
        Self {
            queue,
            task: Some(task),
        }
    }

    /// Returns the leased task.
    pub fn task(&self) -> &Task {
        // Only `finish`/`requeue`/`drop` take the task, and they consume the lease.
        self.task.as_ref().unwrap_or_else(|| unreachable!("lease already finalized"))
    }

    /// Returns the leased task mutably.
    pub fn task_mut(&mut self) -> &mut Task {
        self.task.as_mut().unwrap_or_else(|| unreachable!("lease already finalized"))
    }

    /// Finalizes the task without putting it back (completed or failed).
    pub fn finish(mut self) -> Task {
        let task = self.task.take().unwrap_or_else(|| unreachable!("lease already finalized"));
        self.done();
        task
    }

    /// Puts the task back at the tail of the queue, then finalizes this lease.
    pub fn requeue(mut self) {
        if let Some(task) = self.task.take() {
            self.queue.enqueue(task);
        }
        self.done();
    }

    fn done(&self) {
        if let Err(e) = self.queue.mark_done() {
            error!(error = %e, "Queue accounting error while finalizing a task");
        }
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        if let Some(mut task) = self.task.take() {
            warn!(task_id = %task.id, "Task lease dropped without finalization, releasing task");
            task.release();
            self.queue.enqueue(task);
            self.done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::TaskStatus;

    fn task(id: &str) -> Task {
        Task::new(id, format!("prompt {}", id))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue_batch(vec![task("a"), task("b"), task("c")]);

        assert_eq!(queue.len(), 3);
        let ids: Vec<String> = [
            queue.dequeue(Duration::from_millis(10)).await,
            queue.dequeue(Duration::from_millis(10)).await,
            queue.dequeue(Duration::from_millis(10)).await,
        ]
        .into_iter()
        .map(|t| t.expect("task should be available").id)
        .collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 3);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queue = TaskQueue::new();
        let start = std::time::Instant::now();
        let result = queue.dequeue(Duration::from_millis(30)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(TaskQueue::new());
        let producer = Arc::clone(&queue);

        let waiter = tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.enqueue(task("late"));

        let got = waiter.await.expect("waiter should not panic");
        assert_eq!(got.map(|t| t.id), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_join_waits_for_mark_done() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(task("a"));

        let _held = queue.dequeue(Duration::from_millis(10)).await;
        assert!(queue.is_empty());

        // Empty but not finalized: join must still be pending.
        let pending = tokio::time::timeout(Duration::from_millis(30), queue.join()).await;
        assert!(pending.is_err());

        queue.mark_done().expect("one task is unfinished");
        tokio::time::timeout(Duration::from_millis(100), queue.join())
            .await
            .expect("join should resolve after mark_done");
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_resolves() {
        let queue = TaskQueue::new();
        tokio::time::timeout(Duration::from_millis(50), queue.join())
            .await
            .expect("join on an idle queue resolves immediately");
    }

    #[test]
    fn test_mark_done_too_often() {
        let queue = TaskQueue::new();
        assert!(matches!(queue.mark_done(), Err(QueueError::DoneWithoutTask)));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_tail() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue_batch(vec![task("a"), task("b")]);

        let lease = queue
            .lease(Duration::from_millis(10))
            .await
            .expect("a should be available");
        assert_eq!(lease.task().id, "a");
        lease.requeue();

        assert_eq!(queue.pending_ids(), vec!["b", "a"]);
        assert_eq!(queue.unfinished(), 2);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_task() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(task("a"));

        {
            let mut lease = queue
                .lease(Duration::from_millis(10))
                .await
                .expect("a should be available");
            lease.task_mut().mark_in_progress();
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.unfinished(), 1);
        let back = queue.try_dequeue().expect("task was released");
        assert_eq!(back.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_finish_finalizes() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(task("a"));

        let lease = queue
            .lease(Duration::from_millis(10))
            .await
            .expect("a should be available");
        let done = lease.finish();
        assert_eq!(done.id, "a");
        assert_eq!(queue.unfinished(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_task_once() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue_batch((0..50).map(|i| task(&i.to_string())));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(lease) = q.lease(Duration::from_millis(20)).await {
                    seen.push(lease.finish().id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.expect("consumer should not panic"));
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
        assert_eq!(queue.unfinished(), 0);
    }
}
