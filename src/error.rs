//! Error types shared across session-relay subsystems.
//!
//! Per-task outcomes (recoverable failure, resource exhaustion) are not
//! errors; they are [`crate::session::TaskOutcome`] variants. The types here
//! cover conditions that cross component boundaries:
//! - Session drivers that can no longer serve a worker
//! - Input loading and validation
//! - Result export
//! - Run-level failures surfaced by the orchestrator

use thiserror::Error;

use crate::pipeline::config::ConfigError;
use crate::storage::results::StoreError;

/// Errors raised by a session driver that make the session unusable.
///
/// Any of these terminates the worker holding the session; the orchestrator
/// does not resurrect the slot within the same generation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is unusable: {0}")]
    Fatal(String),

    #[error("Session could not be started: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading the task input.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read input file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse input JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Input must be a JSON array of {{id, prompt}} records")]
    NotAnArray,

    #[error("Input file '{0}' is empty")]
    Empty(String),
}

/// Errors that can occur while exporting results.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unknown export format '{0}': expected 'csv' or 'markdown'")]
    UnknownFormat(String),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level failures returned by the orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Result store write failed: {0}")]
    Store(#[from] StoreError),

    #[error("No session identities configured")]
    NoIdentities,
}
