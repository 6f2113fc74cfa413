//! Class-name files: one label per line.

use std::path::Path;

use crate::error::{OffloadError, Result};

/// Load class names from a file.
pub fn load_labels<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        OffloadError::ModelLoad(format!("Failed to read labels {}: {e}", path.display()))
    })?;
    let labels = parse_labels(&content);
    tracing::info!("Loaded {} class labels from {}", labels.len(), path.display());
    Ok(labels)
}

/// Parse class names, trimming whitespace and skipping a trailing blank line.
pub fn parse_labels(content: &str) -> Vec<String> {
    let mut labels: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    while labels.last().is_some_and(String::is_empty) {
        labels.pop();
    }
    labels
}
