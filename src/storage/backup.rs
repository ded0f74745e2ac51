//! Timestamped backups of the result file.
//!
//! Before a run touches an existing, non-empty result file it is copied to
//! `<stem>.<YYYYmmdd_HHMMSS>.backup.json` in the same directory, and older
//! backups of the same file beyond `max_backups` are removed. Backups are a
//! safety net: every failure here is logged and swallowed.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tracing::{debug, info, warn};

const BACKUP_SUFFIX: &str = ".backup.json";

/// Returns the backup path for `path` at the current local time.
pub fn backup_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    path.with_file_name(format!("{}.{}{}", file_stem(path), stamp, BACKUP_SUFFIX))
}

/// Copies `path` to a timestamped backup if it exists and holds at least
/// one result, then prunes old backups.
///
/// Returns the backup path when one was written.
pub async fn backup_output(path: &Path, max_backups: usize) -> Option<PathBuf> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read result file for backup");
            return None;
        }
    };

    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        debug!(path = %path.display(), "Result file is empty, skipping backup");
        return None;
    }

    let target = backup_path(path);
    if let Err(e) = fs::write(&target, content.as_bytes()).await {
        warn!(path = %path.display(), error = %e, "Failed to create backup");
        return None;
    }
    info!(backup = %target.display(), "Backup created");

    cleanup_old_backups(path, max_backups).await;
    Some(target)
}

/// Removes backups of `path`, keeping only the `max_backups` most recent.
pub async fn cleanup_old_backups(path: &Path, max_backups: usize) {
    let backups = match list_backups(path).await {
        Ok(backups) => backups,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to list backups");
            return;
        }
    };

    for (old, _) in backups.into_iter().skip(max_backups) {
        match fs::remove_file(&old).await {
            Ok(()) => debug!(backup = %old.display(), "Removed old backup"),
            Err(e) => warn!(backup = %old.display(), error = %e, "Failed to remove old backup"),
        }
    }
}

/// Lists the backups of `path`, newest first.
async fn list_backups(path: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{}.", file_stem(path));

    let mut backups = Vec::new();
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(BACKUP_SUFFIX) {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        backups.push((entry.path(), modified));
    }

    // Newest first; the timestamped name breaks mtime ties.
    backups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    Ok(backups)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string())
}
