//! File-backed storage for relay runs.
//!
//! # Overview
//!
//! - **Results**: incremental, crash-safe JSON array of `{key, value}` records
//!   with a resume set for idempotent restarts
//! - **Input**: task loading from JSON arrays or line-oriented text
//! - **Summary**: aggregate run statistics written at the end of a run
//! - **Backup**: timestamped copies of the result file with retention
//! - **Export**: CSV and Markdown renderings of the result file
//!
//! # Usage
//!
//! ```rust,ignore
//! use session_relay::storage::{ResultStore, load_tasks};
//! use session_relay::scheduler::TaskResult;
//!
//! let input = load_tasks("prompts.json", 3).await?;
//! let store = ResultStore::open("final_result.json", true).await?;
//! let todo: Vec<_> = input
//!     .tasks
//!     .into_iter()
//!     .filter(|t| !store.resume_set().contains(&t.id))
//!     .collect();
//!
//! store.append(&TaskResult::new("prompt_001", "answer")).await?;
//! ```

pub mod backup;
pub mod export;
pub mod input;
pub mod results;
pub mod summary;

// Re-export main types for convenience
pub use backup::{backup_output, cleanup_old_backups};
pub use export::{export_results, ExportFormat};
pub use input::{load_tasks, InputFormat, LoadedInput};
pub use results::{load_resume_set, read_results, ResultStore, StoreError};
pub use summary::{format_duration, read_summary, write_summary, RunSummary};
