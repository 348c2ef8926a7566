//! Producer side of the check log, for operators and tests
//!
//! Reads a JSON array of `{"url": ..., "id": ...}` objects and appends it in
//! bounded chunks.

use std::fs;
use std::path::Path;

use streams::{CheckLog, CheckRequest};
use tracing::info;

use crate::error::AppError;

pub fn read_batch(path: &Path) -> Result<Vec<CheckRequest>, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| AppError::ReadBatch { path: path.to_path_buf(), source })?;
    serde_json::from_str(&raw)
        .map_err(|source| AppError::ParseBatch { path: path.to_path_buf(), source })
}

/// Append every request in `path`. Returns the assigned entry ids in order.
pub async fn enqueue_file(
    log: &dyn CheckLog,
    path: &Path,
    chunk_size: usize,
) -> Result<Vec<String>, AppError> {
    let batch = read_batch(path)?;
    if batch.is_empty() {
        info!(path = %path.display(), "batch file is empty, nothing to enqueue");
        return Ok(Vec::new());
    }

    let entry_ids = log.append(&batch, chunk_size).await?;
    info!(path = %path.display(), enqueued = entry_ids.len(), "enqueued check requests");
    Ok(entry_ids)
}
