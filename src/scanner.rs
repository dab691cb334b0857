use crate::processor::{FileProcessor, ProcessOutcome};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::{info, warn};

/// One catch-up pass over the watched directory: every regular file directly
/// inside it (no recursion), oldest modification time first, processed
/// sequentially. Stops early when shutdown fires mid-pass.
pub async fn scan_directory(dir: &Path, processor: &FileProcessor) -> Result<()> {
    let mut entries = Vec::new();
    let mut reader = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {}", dir.display()))?;
    while let Some(entry) = reader
        .next_entry()
        .await
        .with_context(|| format!("failed to list directory {}", dir.display()))?
    {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %entry.path().display(),
                    "failed to stat directory entry; skipping"
                );
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        entries.push((modified, entry.path()));
    }

    if entries.is_empty() {
        info!(dir = %dir.display(), "no files to process");
        return Ok(());
    }

    entries.sort_by_key(|(modified, _)| *modified);
    info!(dir = %dir.display(), file_count = entries.len(), "starting catch-up scan");

    for (_, path) in entries {
        if processor.process(&path).await == ProcessOutcome::Aborted {
            info!("catch-up scan interrupted by shutdown");
            break;
        }
    }
    Ok(())
}
