//! CLI command definitions for session-relay.
//!
//! Three subcommands:
//!
//! - `run`: relay an input file through one or more session identities
//! - `status`: report what a result file already holds and what is left
//! - `export`: convert a result file to CSV or Markdown

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::{init_metrics, write_metrics_file};
use crate::pipeline::{ConfigError, Orchestrator, RunConfig, RunReport, RunStatus};
use crate::session::command::{DEFAULT_EXHAUSTED_EXIT_CODE, DEFAULT_FATAL_EXIT_CODE};
use crate::session::{CommandDriver, HttpDriver, SessionDriver};
use crate::storage::{
    export_results, load_resume_set, load_tasks, read_summary, ExportFormat,
};

/// Distribute a queue of prompts across rotating interactive sessions.
#[derive(Parser)]
#[command(name = "session-relay")]
#[command(about = "Relay a queue of prompts through rotating sessions with resumable output")]
#[command(version)]
#[command(
    long_about = "session-relay sends each prompt of an input file to a session driver, rotating to the next session identity when one runs out of quota.\n\nResults are appended to a JSON array after every task, so an interrupted run can be resumed by running it again.\n\nExample usage:\n  session-relay run prompts.json --identity http://localhost:8001 --identity http://localhost:8002 --driver http --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process an input file, resuming from any existing results.
    Run(Box<RunArgs>),

    /// Show how much of an input file is already recorded.
    Status(StatusArgs),

    /// Convert a result file to CSV or Markdown.
    Export(ExportArgs),
}

/// Session driver kinds selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    /// Spawn `--program` once per task.
    Command,
    /// POST each task to the identity's base URL.
    Http,
}

/// Arguments for `session-relay run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input file: a JSON array of {id, prompt} or one prompt per line.
    pub input: PathBuf,

    /// Session identity (endpoint URL or profile name). Repeat for rotation order.
    #[arg(short = 'i', long = "identity")]
    pub identities: Vec<String>,

    /// Session driver to use.
    #[arg(short = 'd', long, value_enum, default_value = "command")]
    pub driver: DriverKind,

    /// Program spawned per task by the command driver.
    #[arg(long)]
    pub program: Option<String>,

    /// Argument passed to the program. Repeat for several.
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Program exit code meaning the identity is out of quota.
    #[arg(long, default_value_t = DEFAULT_EXHAUSTED_EXIT_CODE)]
    pub exhausted_exit_code: i32,

    /// Program exit code meaning the session is unusable.
    #[arg(long, default_value_t = DEFAULT_FATAL_EXIT_CODE)]
    pub fatal_exit_code: i32,

    /// Name of the environment variable holding a bearer token for the http driver.
    #[arg(long)]
    pub api_key_env: Option<String>,

    /// Per-request timeout of the http driver, in seconds.
    #[arg(long, value_parser = parse_secs)]
    pub request_timeout: Option<Duration>,

    /// YAML configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Result file (JSON array of {key, value}).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Summary file (default: run_metrics.json next to the result file).
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Write a Prometheus text snapshot here when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Maximum workers per cohort.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Retries per task after the first attempt.
    #[arg(short = 'r', long)]
    pub max_retries: Option<u32>,

    /// Base retry backoff, in seconds.
    #[arg(long, value_parser = parse_secs)]
    pub retry_backoff: Option<Duration>,

    /// Pause each worker takes after a task, in seconds.
    #[arg(long, value_parser = parse_secs)]
    pub inter_task_delay: Option<Duration>,

    /// Driver calls slower than this many seconds count as failures.
    #[arg(long, value_parser = parse_secs)]
    pub task_timeout: Option<Duration>,

    /// Driver calls allowed per minute across a cohort.
    #[arg(long)]
    pub requests_per_minute: Option<u32>,

    /// Log progress every this many seconds.
    #[arg(long, value_parser = parse_secs)]
    pub progress_interval: Option<Duration>,

    /// Do not back up an existing result file before the run.
    #[arg(long)]
    pub no_backup: bool,

    /// Skip fsync after each appended result.
    #[arg(long)]
    pub no_sync: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `session-relay status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Result file to inspect.
    #[arg(short = 'o', long, default_value = crate::pipeline::config::DEFAULT_OUTPUT_PATH)]
    pub output: PathBuf,

    /// Input file to compare against the result file.
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Summary file (default: run_metrics.json next to the result file).
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `session-relay export`.
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Result file to export.
    #[arg(short = 'o', long, default_value = crate::pipeline::config::DEFAULT_OUTPUT_PATH)]
    pub output: PathBuf,

    /// Export format (csv, md).
    #[arg(short = 'f', long, default_value = "csv")]
    pub format: String,

    /// Destination file (default: the result file with the format's extension).
    pub dest: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Use this with `run_with_cli` when you need to access CLI args before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the session-relay CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_relay_command(*args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Export(args) => run_export_command(args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_relay_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_run_config(&args, |key| std::env::var(key).ok())?;

    if args.metrics_file.is_some() {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to initialize metrics");
        }
    }

    let report = match args.driver {
        DriverKind::Command => {
            let program = args
                .program
                .clone()
                .context("--program is required with --driver command")?;
            let driver = CommandDriver::new(program)
                .with_args(args.args.clone())
                .with_exhausted_exit_code(args.exhausted_exit_code)
                .with_fatal_exit_code(args.fatal_exit_code);
            relay(config, driver, &args.input).await?
        }
        DriverKind::Http => {
            let mut driver = HttpDriver::new();
            if let Some(ref name) = args.api_key_env {
                let key = std::env::var(name)
                    .map_err(|_| ConfigError::MissingEnvVar(name.clone()))?;
                driver = driver.with_api_key(key);
            }
            if let Some(timeout) = args.request_timeout {
                driver = driver.with_request_timeout(timeout);
            }
            relay(config, driver, &args.input).await?
        }
    };

    if let Some(ref path) = args.metrics_file {
        write_metrics_file(path)
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics snapshot written");
    }

    if args.json {
        let json_output = serde_json::to_string_pretty(&report.summary())
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_report(&report);
    }

    if report.status == RunStatus::Fatal {
        anyhow::bail!(
            "Run {}: {} tasks left pending",
            report.status.description(),
            report.pending()
        );
    }

    Ok(())
}

async fn relay<D: SessionDriver>(
    config: RunConfig,
    driver: D,
    input: &Path,
) -> anyhow::Result<RunReport> {
    let orchestrator = Orchestrator::new(config, driver)?;
    orchestrator
        .run_from_file(input)
        .await
        .with_context(|| format!("Run over {} failed", input.display()))
}

/// Builds the run configuration: defaults, then `--config`, then `RELAY_*`
/// variables from `lookup`, then command-line flags.
fn build_run_config<F>(args: &RunArgs, lookup: F) -> anyhow::Result<RunConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match args.config {
        Some(ref path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RunConfig::new(),
    };
    config.apply_env_with(lookup)?;

    if !args.identities.is_empty() {
        config = config.with_identities(args.identities.iter().cloned());
    }
    if let Some(workers) = args.workers {
        config = config.with_max_workers(workers);
    }
    if let Some(retries) = args.max_retries {
        config = config.with_max_retries(retries);
    }
    if let Some(base) = args.retry_backoff {
        let max = config.retry_backoff_max.max(base);
        config = config.with_retry_backoff(base, max);
    }
    if let Some(delay) = args.inter_task_delay {
        config = config.with_inter_task_delay(delay);
    }
    if args.task_timeout.is_some() {
        config = config.with_task_timeout(args.task_timeout);
    }
    if args.requests_per_minute.is_some() {
        config = config.with_requests_per_minute(args.requests_per_minute);
    }
    if args.progress_interval.is_some() {
        config = config.with_progress_interval(args.progress_interval);
    }
    if let Some(ref output) = args.output {
        config = config.with_output_path(output);
    }
    if let Some(ref summary) = args.summary {
        config = config.with_summary_path(summary);
    }
    if args.no_backup {
        let max = config.max_backups;
        config = config.with_backups(false, max);
    }
    if args.no_sync {
        config = config.with_sync_writes(false);
    }

    Ok(config)
}

fn print_report(report: &RunReport) {
    let mark = match report.status {
        RunStatus::Completed => "✓",
        RunStatus::IdentitiesExhausted => "!",
        RunStatus::Fatal => "✗",
    };
    println!("{} Run {}", mark, report.status.description());
    println!("  Run id:     {}", report.run_id);
    println!(
        "  Tasks:      {} total, {} completed, {} failed, {} pending, {} skipped",
        report.total,
        report.completed,
        report.failed,
        report.pending(),
        report.skipped
    );
    println!("  Success:    {:.1}%", report.success_rate());
    println!(
        "  Identities: {} consumed over {} generation(s)",
        report.identities_consumed(),
        report.generations.len()
    );
    println!(
        "  Duration:   {}",
        crate::storage::format_duration(report.total_duration.as_secs_f64())
    );
    if !report.failed_task_ids.is_empty() {
        println!("  Failed:     {}", report.failed_task_ids.join(", "));
    }
}

// ============================================================================
// Status Command Implementation
// ============================================================================

#[derive(Serialize)]
struct StatusOutput {
    output: String,
    recorded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status: Option<RunStatus>,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let recorded = load_resume_set(&args.output).await;

    let (input_tasks, remaining) = match args.input {
        Some(ref input) => {
            let loaded = load_tasks(input, crate::scheduler::DEFAULT_MAX_RETRIES)
                .await
                .with_context(|| format!("Failed to load input {}", input.display()))?;
            let remaining = loaded
                .tasks
                .iter()
                .filter(|t| !recorded.contains(&t.id))
                .count();
            (Some(loaded.tasks.len()), Some(remaining))
        }
        None => (None, None),
    };

    let summary_path = match args.summary {
        Some(ref path) => path.clone(),
        None => args
            .output
            .with_file_name(crate::pipeline::config::DEFAULT_SUMMARY_FILE),
    };
    let summary = read_summary(&summary_path).await.ok();

    if args.json {
        let output = StatusOutput {
            output: args.output.display().to_string(),
            recorded: recorded.len(),
            input_tasks,
            remaining,
            last_status: summary.as_ref().map(|s| s.status),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Result file: {}", args.output.display());
    println!("  Recorded:  {}", recorded.len());
    if let (Some(total), Some(remaining)) = (input_tasks, remaining) {
        println!("  Input:     {} tasks, {} remaining", total, remaining);
    }
    if let Some(summary) = summary {
        println!(
            "  Last run:  {} ({} successful, {} failed, {} pending, {})",
            summary.status.description(),
            summary.successful,
            summary.failed,
            summary.pending,
            summary.formatted_duration
        );
    }

    Ok(())
}

// ============================================================================
// Export Command Implementation
// ============================================================================

async fn run_export_command(args: ExportArgs) -> anyhow::Result<()> {
    let format: ExportFormat = args.format.parse()?;
    let dest = args
        .dest
        .clone()
        .unwrap_or_else(|| args.output.with_extension(format.extension()));

    let count = export_results(&args.output, &dest, format)
        .await
        .with_context(|| format!("Failed to export {}", args.output.display()))?;

    println!("✓ Exported {} results to {}", count, dest.display());
    Ok(())
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}
