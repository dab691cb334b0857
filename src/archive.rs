use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Processed,
    Failed,
}

/// Moves finished files into `<processed|failed>/<YYYY-MM>/<basename>`.
///
/// The bucket comes from the file's modification time, falling back to the
/// current time when the mtime cannot be read. Basename collisions overwrite;
/// deduplication is deliberately not attempted here.
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    processed_dir: PathBuf,
    failed_dir: PathBuf,
}

impl ArchiveManager {
    pub fn new(processed_dir: PathBuf, failed_dir: PathBuf) -> Self {
        Self {
            processed_dir,
            failed_dir,
        }
    }

    pub async fn move_file(&self, path: &Path, outcome: ArchiveOutcome) -> Result<PathBuf> {
        let timestamp = file_timestamp(path).await.unwrap_or_else(Utc::now);
        let bucket = timestamp.format("%Y-%m").to_string();
        let root = match outcome {
            ArchiveOutcome::Processed => &self.processed_dir,
            ArchiveOutcome::Failed => &self.failed_dir,
        };
        let destination_dir = root.join(bucket);
        fs::create_dir_all(&destination_dir).await.with_context(|| {
            format!(
                "failed to create archive directory {}",
                destination_dir.display()
            )
        })?;

        let basename = path
            .file_name()
            .with_context(|| format!("{} has no basename", path.display()))?;
        let destination = destination_dir.join(basename);

        if let Err(rename_err) = fs::rename(path, &destination).await {
            // Rename fails across filesystems; fall back to copy + remove.
            fs::copy(path, &destination).await.with_context(|| {
                format!(
                    "failed to move {} to {} ({rename_err})",
                    path.display(),
                    destination.display()
                )
            })?;
            fs::remove_file(path)
                .await
                .with_context(|| format!("failed to remove source file {}", path.display()))?;
        }

        info!(
            source = %path.display(),
            destination = %destination.display(),
            outcome = ?outcome,
            "file archived"
        );
        Ok(destination)
    }
}

async fn file_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    match fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => Some(DateTime::<Utc>::from(modified)),
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "could not read file mtime; bucketing by current time"
            );
            None
        }
    }
}
