//! File system utilities

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

const MAX_FILENAME_CHARS: usize = 100;

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| anyhow!("Failed to create directory {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Sanitize a title into a file name: reserved characters are removed and the
/// result is capped at 100 characters
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_CHARS)
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<dir>/<stem>.<ext>`, or `<stem>_1.<ext>`, `<stem>_2.<ext>`… when taken
pub fn unique_output_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    unique_output_path_with(dir, stem, extension, |p| p.exists())
}

/// Like [`unique_output_path`], with the caller deciding what counts as taken
pub fn unique_output_path_with(
    dir: &Path,
    stem: &str,
    extension: &str,
    is_taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", stem, extension));
    if !is_taken(&candidate) {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}.{}", stem, n, extension));
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
