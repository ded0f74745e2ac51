//! Run pipeline: configuration, orchestration and progress reporting.
//!
//! # Architecture
//!
//! - **Config**: `RunConfig`, layered from defaults, a YAML file, `RELAY_*`
//!   environment variables and CLI flags
//! - **Orchestrator**: the generation loop that binds cohorts of workers to
//!   successive session identities until the queue drains
//! - **Progress**: an optional background monitor logging run counters
//!
//! # Run Flow
//!
//! 1. **Load**: tasks are read from a JSON array or a text file
//! 2. **Resume**: tasks already present in the result file are skipped
//! 3. **Cohort**: workers are spawned against the first identity
//! 4. **Rotate**: on exhaustion or collapse the cohort is stopped and the next
//!    identity gets a fresh cohort
//! 5. **Report**: a `RunReport` is returned and a summary file written
//!
//! # Example
//!
//! ```rust,ignore
//! use session_relay::pipeline::{Orchestrator, RunConfig};
//! use session_relay::session::HttpDriver;
//!
//! let config = RunConfig::new()
//!     .with_identities(["http://localhost:8001", "http://localhost:8002"])
//!     .with_max_workers(4)
//!     .with_output_path("final_result.json");
//!
//! let orchestrator = Orchestrator::new(config, HttpDriver::new())?;
//! let report = orchestrator.run_from_file("prompts.json").await?;
//!
//! println!("{}: {} completed, {} pending", report.status, report.completed, report.pending());
//! ```

pub mod config;
pub mod orchestrator;
pub mod progress;

pub use config::{ConfigError, FileConfig, RunConfig, MAX_WORKERS_LIMIT};
pub use orchestrator::{
    GenerationEnd, GenerationReport, Orchestrator, RunReport, RunStatus,
};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
