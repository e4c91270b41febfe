//! On-disk JSON document holding restart counters between supervisor runs.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::models::recovery::RecoveryState;
use crate::{AppError, Result};

/// Read the state document. A missing file yields the default state.
///
/// # Errors
///
/// Returns `AppError::Io` if the file exists but cannot be read, or
/// `AppError::Serialization` if it is not valid JSON.
pub fn load(path: &Path) -> Result<RecoveryState> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RecoveryState::default()),
        Err(err) => Err(AppError::Io(format!(
            "failed to read recovery state {}: {err}",
            path.display()
        ))),
    }
}

/// Write the state document atomically (temp file in the same directory,
/// then rename).
///
/// # Errors
///
/// Returns `AppError::Io` on directory creation, write, or rename failure.
pub fn save(path: &Path, state: &RecoveryState) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create directory {}: {err}",
            parent.display()
        ))
    })?;

    let body = serde_json::to_vec_pretty(state)?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(&body)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path).map_err(|err| {
        AppError::Io(format!(
            "failed to persist recovery state to {}: {err}",
            path.display()
        ))
    })?;
    Ok(())
}
