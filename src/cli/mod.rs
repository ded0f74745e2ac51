//! Command-line interface for session-relay.
//!
//! Provides the `run`, `status` and `export` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, DriverKind};
