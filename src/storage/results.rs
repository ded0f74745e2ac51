//! Incremental, crash-safe result store.
//!
//! Results are persisted as a single JSON array of `{"key", "value"}`
//! records. The file is a complete, parseable array after every append:
//! each append overwrites only the closing `\n]` region with
//! `,\n  {record}\n]`, so previously written entries are never rewritten.
//!
//! ```text
//! [
//!   {"key":"a","value":"..."},
//!   {"key":"b","value":"..."}
//! ]
//! ```
//!
//! Appends are serialized by an internal async mutex; callers never need
//! external locking. A failed append leaves the write offset untouched, so
//! the next append overwrites any partial bytes.
//!
//! Each append reopens the file by path without creating it. A result file
//! removed mid-run fails the append instead of writing to an unlinked inode.
//!
//! On open, the keys already present form the *resume set*. A file that
//! cannot be parsed is moved aside and replaced by an empty array: it is
//! safer to reprocess than to skip tasks on a guess.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::scheduler::TaskResult;

/// Contents written to initialize an empty store.
const EMPTY_ARRAY: &str = "[]";

/// Errors that can occur during result store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read or write the backing file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize a record.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing file is not a JSON array of records.
    #[error("Result file '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

struct StoreState {
    keys: HashSet<String>,
    count: usize,
    /// Offset just past the last record (or past `[` when empty).
    tail: u64,
}

/// Append-only JSON array of results with single-writer discipline.
pub struct ResultStore {
    path: PathBuf,
    sync_writes: bool,
    resume_set: HashSet<String>,
    state: Mutex<StoreState>,
}

impl ResultStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// Missing parent directories are created. A missing or blank file is
    /// initialized to `[]`. A corrupt file is renamed to
    /// `<name>.corrupt-<timestamp>` and replaced by `[]`.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the JSON result file
    /// * `sync_writes` - Whether to `fsync` after every append
    pub async fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let (records, tail) = if content.trim().is_empty() {
            fs::write(&path, EMPTY_ARRAY).await?;
            (Vec::new(), 1)
        } else {
            match parse_records(&content) {
                Ok(records) => {
                    let tail = record_tail(&content);
                    (records, tail)
                }
                Err(reason) => {
                    let aside = corrupt_path(&path);
                    warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        reason = %reason,
                        "Result file is corrupt, starting a fresh one"
                    );
                    fs::rename(&path, &aside).await?;
                    fs::write(&path, EMPTY_ARRAY).await?;
                    (Vec::new(), 1)
                }
            }
        };

        let keys: HashSet<String> = records.into_iter().map(|r| r.key).collect();
        let count = keys.len();

        // Fail at open, not at the first result, when the file is read-only.
        fs::OpenOptions::new().write(true).open(&path).await?;

        info!(
            path = %path.display(),
            existing = count,
            "Result store opened"
        );

        Ok(Self {
            path,
            sync_writes,
            resume_set: keys.clone(),
            state: Mutex::new(StoreState {
                keys,
                count,
                tail,
            }),
        })
    }

    /// Returns the keys that were already recorded when the store was opened.
    pub fn resume_set(&self) -> &HashSet<String> {
        &self.resume_set
    }

    /// Durably appends one result.
    ///
    /// Returns `Ok(false)` without writing if the key is already recorded.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails. The result is then not
    /// recorded and the file still holds the previous complete array.
    pub async fn append(&self, result: &TaskResult) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;

        if state.keys.contains(&result.key) {
            debug!(key = %result.key, "Result already recorded, skipping append");
            return Ok(false);
        }

        let record = serde_json::to_string(result)?;
        let chunk = if state.count == 0 {
            format!("\n  {}\n]", record)
        } else {
            format!(",\n  {}\n]", record)
        };

        let tail = state.tail;
        let new_len = tail + chunk.len() as u64;

        let mut file = fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(tail)).await?;
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        file.set_len(new_len).await?;
        if self.sync_writes {
            file.sync_data().await?;
        }

        // Next record starts just before the closing "\n]".
        state.tail = new_len - 2;
        state.count += 1;
        state.keys.insert(result.key.clone());

        debug!(key = %result.key, total = state.count, "Result appended");
        Ok(true)
    }

    /// Returns whether `key` is recorded.
    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.keys.contains(key)
    }

    /// Returns the number of recorded results.
    pub async fn len(&self) -> usize {
        self.state.lock().await.count
    }

    /// Returns whether no result is recorded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Loads the set of keys recorded in the result file at `path`.
///
/// A missing file yields an empty set. A file that cannot be parsed is
/// logged and also yields an empty set.
pub async fn load_resume_set(path: impl AsRef<Path>) -> HashSet<String> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read result file, resuming from scratch");
            return HashSet::new();
        }
    };

    if content.trim().is_empty() {
        return HashSet::new();
    }

    match parse_records(&content) {
        Ok(records) => records.into_iter().map(|r| r.key).collect(),
        Err(reason) => {
            warn!(path = %path.display(), reason = %reason, "Failed to parse result file, resuming from scratch");
            HashSet::new()
        }
    }
}

/// Reads every record from the result file at `path`.
///
/// # Errors
///
/// Returns `StoreError::Corrupt` if the file is not a JSON array of records.
pub async fn read_results(path: impl AsRef<Path>) -> Result<Vec<TaskResult>, StoreError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    parse_records(&content).map_err(|reason| StoreError::Corrupt {
        path: path.display().to_string(),
        reason,
    })
}

fn parse_records(content: &str) -> Result<Vec<TaskResult>, String> {
    serde_json::from_str::<Vec<TaskResult>>(content).map_err(|e| e.to_string())
}

/// Offset just past the last record of a well-formed array.
fn record_tail(content: &str) -> u64 {
    let close = content.rfind(']').unwrap_or(content.len());
    content[..close].trim_end().len() as u64
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results.json".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}
