//! Output variables captured from the test command.
//!
//! The composed script appends `NAME value` lines to a per-step file; after a
//! successful run the requested names are read back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File the script writes output variables to.
pub fn output_file(tmp_dir: &Path, step_id: &str) -> PathBuf {
    tmp_dir.join(format!("{}-output.env", step_id))
}

/// Parses `NAME value` lines, keeping only `names`. A later line for the same
/// name wins; a name without a value maps to an empty string.
pub fn parse_outputs(content: &str, names: &[String]) -> HashMap<String, String> {
    let mut outputs = HashMap::new();
    for line in content.lines() {
        let line = line.trim_end();
        let (name, value) = line.split_once(' ').unwrap_or((line, ""));
        if names.iter().any(|n| n == name) {
            outputs.insert(name.to_string(), value.to_string());
        }
    }
    outputs
}

/// Reads the output variables written by the last run.
pub async fn read_outputs(
    path: &Path,
    names: &[String],
) -> std::io::Result<HashMap<String, String>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_outputs(&content, names))
}

/// Removes a stale output file left by an earlier attempt.
pub async fn clear_outputs(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
