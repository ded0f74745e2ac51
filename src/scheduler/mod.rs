//! In-process task scheduling for session workers.
//!
//! This module provides the concurrency core of a relay run:
//!
//! - **TaskQueue**: FIFO queue with timed dequeue and a quiescence barrier
//! - **Worker**: pulls tasks, drives one session, applies the retry policy
//! - **GenerationSignal**: per-cohort stop flag raised on quota exhaustion
//! - **RateLimiter**: optional token bucket shared by a cohort
//! - **Task**: task definitions with a bounded retry budget
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ enqueue / join
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │◄──── requeue (tail)
//!                      └──────┬───────┘
//!                             │ lease
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │       GenerationSignal (exhausted)    │
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      ┌──────────────┐
//!                      │ ResultStore  │
//!                      └──────────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Leases**: a dequeued task is always finished or requeued, even if the
//!   worker holding it goes away
//! - **Tail requeue**: retries never overtake fresh tasks
//! - **Fresh signal per generation**: a stale exhaustion flag cannot stop
//!   the next cohort

pub mod job;
pub mod queue;
pub mod rate_limiter;
pub mod signal;
pub mod worker;

// Re-export main types for convenience
pub use job::{Task, TaskResult, TaskStatus, DEFAULT_MAX_RETRIES};
pub use queue::{QueueError, TaskLease, TaskQueue};
pub use rate_limiter::RateLimiter;
pub use signal::GenerationSignal;
pub use worker::{Worker, WorkerConfig, WorkerExit, WorkerReport, WorkerStats};
