//! Task input loading.
//!
//! Two formats are accepted:
//!
//! - **JSON**: an array of `{"id": ..., "prompt": ...}` objects. Numeric ids
//!   are stringified. An entry without an id gets `prompt_NNN` from its
//!   1-based position, suffixed `_2`, `_3`, ... if an explicit id already
//!   claims that name; an entry without a usable prompt is skipped.
//! - **Text**: one prompt per non-empty line, id `prompt_NNN` from the line
//!   number.
//!
//! Duplicate ids keep their first occurrence. Skipped entries are logged
//! and counted, never fatal; only an unreadable or unparseable source
//! fails the load.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::InputError;
use crate::scheduler::Task;

/// Source format of the input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Json,
    Text,
}

impl InputFormat {
    /// Picks the format from the file extension: `.txt` and `.text` are
    /// line-oriented, anything else is JSON.
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("txt") | Some("text") => InputFormat::Text,
            _ => InputFormat::Json,
        }
    }
}

/// Tasks accepted from an input source, plus what was dropped.
#[derive(Debug, Clone, Default)]
pub struct LoadedInput {
    pub tasks: Vec<Task>,
    /// Entries without a usable prompt.
    pub skipped_invalid: usize,
    /// Entries whose id was already seen.
    pub skipped_duplicate: usize,
}

/// Returns the id assigned to an entry at 1-based `position`.
pub fn auto_id(position: usize) -> String {
    format!("prompt_{:03}", position)
}

/// Loads tasks from `path`, detecting the format from its extension.
///
/// # Errors
///
/// Returns `InputError` if the file cannot be read, is blank, or (for
/// JSON) is not an array.
pub async fn load_tasks(path: impl AsRef<Path>, max_retries: u32) -> Result<LoadedInput, InputError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })?;

    if content.trim().is_empty() {
        return Err(InputError::Empty(path.display().to_string()));
    }

    let loaded = match InputFormat::detect(path) {
        InputFormat::Json => parse_json_tasks(&content, max_retries)?,
        InputFormat::Text => parse_text_tasks(&content, max_retries),
    };

    info!(
        path = %path.display(),
        tasks = loaded.tasks.len(),
        skipped_invalid = loaded.skipped_invalid,
        skipped_duplicate = loaded.skipped_duplicate,
        "Loaded input"
    );

    Ok(loaded)
}

/// Parses a JSON array of `{id, prompt}` records.
pub fn parse_json_tasks(content: &str, max_retries: u32) -> Result<LoadedInput, InputError> {
    let Value::Array(entries) = serde_json::from_str::<Value>(content)? else {
        return Err(InputError::NotAnArray);
    };

    let mut accepted: Vec<(usize, Option<String>, &str)> = Vec::with_capacity(entries.len());
    let mut builder = Builder::new(max_retries);
    for (index, entry) in entries.iter().enumerate() {
        let position = index + 1;

        let prompt = entry
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let Some(prompt) = prompt else {
            warn!(position = position, "Skipping input entry without a prompt");
            builder.skipped_invalid += 1;
            continue;
        };

        let id = match entry.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        accepted.push((position, id, prompt));
    }

    // Explicit ids win over generated ones regardless of order.
    let explicit: HashSet<String> = accepted
        .iter()
        .filter_map(|(_, id, _)| id.clone())
        .collect();

    for (position, id, prompt) in accepted {
        let id = match id {
            Some(id) => id,
            None => unclaimed_auto_id(position, &explicit, &builder.seen),
        };
        builder.push(id, prompt);
    }

    Ok(builder.finish())
}

fn unclaimed_auto_id(position: usize, explicit: &HashSet<String>, seen: &HashSet<String>) -> String {
    let base = auto_id(position);
    let taken = |id: &String| explicit.contains(id) || seen.contains(id);
    if !taken(&base) {
        return base;
    }

    let mut suffix = 2;
    loop {
        let candidate = format!("{}_{}", base, suffix);
        if !taken(&candidate) {
            warn!(
                position = position,
                claimed = %base,
                task_id = %candidate,
                "Generated id collides with an explicit id, renaming"
            );
            return candidate;
        }
        suffix += 1;
    }
}

/// Parses one prompt per non-empty line.
pub fn parse_text_tasks(content: &str, max_retries: u32) -> LoadedInput {
    let mut builder = Builder::new(max_retries);
    for (index, line) in content.lines().enumerate() {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        builder.push(auto_id(index + 1), prompt);
    }
    builder.finish()
}

struct Builder {
    max_retries: u32,
    seen: HashSet<String>,
    tasks: Vec<Task>,
    skipped_invalid: usize,
    skipped_duplicate: usize,
}

impl Builder {
    fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            seen: HashSet::new(),
            tasks: Vec::new(),
            skipped_invalid: 0,
            skipped_duplicate: 0,
        }
    }

    fn push(&mut self, id: String, prompt: &str) {
        if !self.seen.insert(id.clone()) {
            warn!(task_id = %id, "Skipping duplicate task id");
            self.skipped_duplicate += 1;
            return;
        }
        self.tasks
            .push(Task::new(id, prompt).with_max_retries(self.max_retries));
    }

    fn finish(self) -> LoadedInput {
        LoadedInput {
            tasks: self.tasks,
            skipped_invalid: self.skipped_invalid,
            skipped_duplicate: self.skipped_duplicate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(loaded: &LoadedInput) -> Vec<&str> {
        loaded.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_json_records() {
        let loaded = parse_json_tasks(
            r#"[
                {"id": "a", "prompt": "first"},
                {"prompt": "no id"},
                {"id": 7, "prompt": "numeric id"},
                {"id": "b"},
                {"id": "c", "prompt": "   "},
                {"id": "a", "prompt": "dup"}
            ]"#,
            2,
        )
        .expect("valid input");

        assert_eq!(ids(&loaded), vec!["a", "prompt_002", "7"]);
        assert_eq!(loaded.tasks[0].text, "first");
        assert_eq!(loaded.tasks[0].max_retries, 2);
        assert_eq!(loaded.skipped_invalid, 2);
        assert_eq!(loaded.skipped_duplicate, 1);
    }

    #[test]
    fn test_auto_id_yields_to_explicit_id() {
        let loaded = parse_json_tasks(
            r#"[
                {"prompt": "generated"},
                {"id": "prompt_001", "prompt": "explicit"},
                {"id": "prompt_001_2", "prompt": "also explicit"}
            ]"#,
            3,
        )
        .expect("valid input");

        assert_eq!(ids(&loaded), vec!["prompt_001_3", "prompt_001", "prompt_001_2"]);
        assert_eq!(loaded.tasks[0].text, "generated");
        assert_eq!(loaded.skipped_duplicate, 0);
    }

    #[test]
    fn test_json_must_be_array() {
        assert!(matches!(
            parse_json_tasks(r#"{"id": "a"}"#, 3),
            Err(InputError::NotAnArray)
        ));
        assert!(matches!(parse_json_tasks("[{", 3), Err(InputError::Json(_))));
    }

    #[test]
    fn test_text_lines() {
        let loaded = parse_text_tasks("first\n\n  second  \nthird\n", 3);
        assert_eq!(ids(&loaded), vec!["prompt_001", "prompt_003", "prompt_004"]);
        assert_eq!(loaded.tasks[1].text, "second");
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(InputFormat::detect(Path::new("a.txt")), InputFormat::Text);
        assert_eq!(InputFormat::detect(Path::new("a.TEXT")), InputFormat::Text);
        assert_eq!(InputFormat::detect(Path::new("a.json")), InputFormat::Json);
        assert_eq!(InputFormat::detect(Path::new("prompts")), InputFormat::Json);
    }

    #[tokio::test]
    async fn test_load_tasks_from_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("prompts.txt");
        tokio::fs::write(&path, "one\ntwo\n").await.expect("write");

        let loaded = load_tasks(&path, 1).await.expect("load should succeed");
        assert_eq!(ids(&loaded), vec!["prompt_001", "prompt_002"]);
    }

    #[tokio::test]
    async fn test_load_tasks_errors() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let missing = load_tasks(dir.path().join("missing.json"), 3).await;
        assert!(matches!(missing, Err(InputError::Io { .. })));

        let blank = dir.path().join("blank.json");
        tokio::fs::write(&blank, "  \n").await.expect("write");
        assert!(matches!(load_tasks(&blank, 3).await, Err(InputError::Empty(_))));
    }
}
