//! Export of the result file to other formats.
//!
//! - **csv**: `key,value` header then one row per result, quoted as needed
//! - **markdown**: one `## key` section per result

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use super::results::read_results;
use crate::error::ExportError;
use crate::scheduler::TaskResult;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Markdown,
}

impl ExportFormat {
    /// Conventional file extension for the format.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Markdown => "md",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Renders results as CSV.
pub fn to_csv(results: &[TaskResult]) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Renders results as a Markdown document.
pub fn to_markdown(results: &[TaskResult]) -> String {
    let mut out = String::from("# Results\n");
    for result in results {
        // Writing to a String cannot fail.
        let _ = write!(out, "\n## {}\n\n{}\n", result.key, result.value.trim_end());
    }
    out
}

/// Reads the result file at `input` and writes it to `output` in `format`.
///
/// Returns the number of exported results.
pub async fn export_results(
    input: &Path,
    output: &Path,
    format: ExportFormat,
) -> Result<usize, ExportError> {
    let results = read_results(input).await?;

    let rendered = match format {
        ExportFormat::Csv => to_csv(&results)?,
        ExportFormat::Markdown => to_markdown(&results),
    };

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(output, rendered).await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        format = format.extension(),
        results = results.len(),
        "Results exported"
    );
    Ok(results.len())
}
