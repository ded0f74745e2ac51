//! session-relay: distribute a queue of text prompts across rotating
//! interactive sessions.
//!
//! Tasks are pulled from a shared queue by a cohort of workers, each bound
//! to one long-lived session through a [`session::SessionDriver`]. When a
//! session identity runs out of quota the cohort is stopped and a fresh one
//! is started against the next identity. Every result is appended to a JSON
//! array on disk as soon as it is produced, so a run can be interrupted and
//! resumed without reprocessing anything.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use error::{ExportError, InputError, RunError, SessionError};
pub use pipeline::{Orchestrator, RunConfig, RunReport, RunStatus};
pub use scheduler::{Task, TaskResult, TaskStatus};
pub use session::{SessionDriver, SessionIdentity, TaskOutcome};
pub use storage::{ResultStore, StoreError};
