//! Run summary file.
//!
//! Written once at the end of a run, next to the result file by default
//! (`run_metrics.json`). The file is replaced atomically: it is written to
//! a temporary sibling and renamed into place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use super::results::StoreError;
use crate::pipeline::orchestrator::RunStatus;
use crate::scheduler::WorkerStats;

/// Aggregate statistics of one run, as persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// Tasks handed to the run, including skipped ones.
    pub total: usize,
    pub successful: u64,
    pub failed: u64,
    /// Tasks left unprocessed when identities ran out.
    pub pending: usize,
    /// Tasks already present in the result file before the run.
    pub skipped: usize,
    /// Percentage of scheduled tasks that succeeded.
    pub success_rate: f64,
    /// Mean driver time per successful task, in seconds.
    pub average_processing_time: f64,
    /// Driver time summed over every worker, in seconds.
    pub total_processing_time: f64,
    /// Wall-clock run time, in seconds.
    pub total_duration: f64,
    pub formatted_duration: String,
    pub identities_consumed: usize,
    pub workers_used: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_task_ids: Vec<String>,
    #[serde(default)]
    pub pending_task_ids: Vec<String>,
    #[serde(default)]
    pub workers: Vec<WorkerStats>,
}

/// Formats seconds as `12.34s`, `2.50m` or `1.20h`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.2}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.2}m", seconds / 60.0)
    } else {
        format!("{:.2}h", seconds / 3600.0)
    }
}

/// Writes `summary` to `path` as pretty-printed JSON.
pub async fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(summary)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;

    info!(path = %path.display(), status = %summary.status, "Run summary saved");
    Ok(())
}

/// Reads a summary previously written by [`write_summary`].
pub async fn read_summary(path: &Path) -> Result<RunSummary, StoreError> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "summary.json".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}
