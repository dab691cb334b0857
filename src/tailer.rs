use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, info, warn};

const MAX_READ_CHUNK_BYTES: u64 = 8 * 1024 * 1024; // 8 MiB per read

/// On-disk identity of the open log file, compared for equality before each
/// read to detect rotation. Unix uses device + inode; other platforms fall
/// back to the creation timestamp, which is weaker detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    #[cfg(not(unix))]
    created: Option<std::time::SystemTime>,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    }
}

#[cfg(not(unix))]
fn file_id(meta: &std::fs::Metadata) -> FileId {
    FileId {
        created: meta.created().ok(),
    }
}

enum TailState {
    Unopened,
    Tailing {
        file: fs::File,
        offset: u64,
        id: FileId,
    },
    Detached,
}

/// Incremental reader over a single growing log file.
///
/// The first open seeks to end-of-file so a fresh process never replays
/// history. After a rotation (identity change or file vanishing) the remaining
/// lines of the old generation are drained through the still-open handle, then
/// the path is reopened from the beginning. Offsets are held in memory only;
/// a restart resets to end-of-file.
pub struct LogTailer {
    path: PathBuf,
    state: TailState,
    /// Bytes of a trailing line that has not yet seen its newline.
    pending: Vec<u8>,
}

impl LogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: TailState::Unopened,
            pending: Vec::new(),
        }
    }

    /// Reads every complete line appended since the last poll, in order.
    /// Handles rotation transparently: drained old-generation lines come
    /// first, followed by lines of the new generation read from offset 0.
    pub async fn poll(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();

        if let TailState::Unopened = self.state {
            self.state = self.initial_open().await;
        }

        if let TailState::Tailing { .. } = self.state {
            self.check_identity(&mut lines).await?;
        }

        match &mut self.state {
            TailState::Tailing { file, offset, .. } => {
                read_lines(file, offset, &mut self.pending, &mut lines).await?;
            }
            TailState::Detached => {
                if let Some((file, id)) = self.try_reopen().await {
                    info!(
                        path = %self.path.display(),
                        "reopened log file; reading new generation from the beginning"
                    );
                    self.state = TailState::Tailing {
                        file,
                        offset: 0,
                        id,
                    };
                    if let TailState::Tailing { file, offset, .. } = &mut self.state {
                        read_lines(file, offset, &mut self.pending, &mut lines).await?;
                    }
                }
            }
            TailState::Unopened => {}
        }

        Ok(lines)
    }

    async fn initial_open(&self) -> TailState {
        let file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "log file not available at startup; waiting for it to appear"
                );
                return TailState::Detached;
            }
        };
        match file.metadata().await {
            Ok(meta) => {
                let offset = meta.len();
                info!(
                    path = %self.path.display(),
                    offset,
                    "opened log file at end; tailing new lines only"
                );
                TailState::Tailing {
                    file,
                    offset,
                    id: file_id(&meta),
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to stat freshly opened log file"
                );
                TailState::Detached
            }
        }
    }

    /// Compares the path's current identity against the open handle. On
    /// mismatch (or a vanished path) the old handle is drained at the stored
    /// offset before it is closed, so the final lines written just before the
    /// rotation are not lost. An in-place truncation that keeps the identity
    /// resets the offset to the start of the file.
    async fn check_identity(&mut self, lines: &mut Vec<String>) -> Result<()> {
        let current = match fs::metadata(&self.path).await {
            Ok(meta) => Some((file_id(&meta), meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to stat log file {}", self.path.display())
                })
            }
        };

        let TailState::Tailing { file, offset, id } = &mut self.state else {
            return Ok(());
        };

        match current {
            Some((current_id, len)) if current_id == *id => {
                if len < *offset {
                    warn!(
                        path = %self.path.display(),
                        previous_offset = *offset,
                        current_size = len,
                        "log file truncated in place; resetting to beginning"
                    );
                    *offset = 0;
                    self.pending.clear();
                }
                Ok(())
            }
            _ => {
                if let Err(err) = read_lines(file, offset, &mut self.pending, lines).await {
                    warn!(
                        error = %err,
                        path = %self.path.display(),
                        "failed to drain old log generation before reopen"
                    );
                }
                // The producer finishes the old file before switching, so a
                // trailing unterminated line is complete at this point.
                if !self.pending.is_empty() {
                    let tail = std::mem::take(&mut self.pending);
                    lines.push(String::from_utf8_lossy(&tail).into_owned());
                }
                info!(
                    path = %self.path.display(),
                    drained = lines.len(),
                    "log rotation detected; closing old generation"
                );
                self.state = TailState::Detached;
                Ok(())
            }
        }
    }

    async fn try_reopen(&self) -> Option<(fs::File, FileId)> {
        match fs::File::open(&self.path).await {
            Ok(file) => match file.metadata().await {
                Ok(meta) => Some((file, file_id(&meta))),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %self.path.display(),
                        "failed to stat reopened log file"
                    );
                    None
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "log file still missing; will retry");
                None
            }
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to reopen log file"
                );
                None
            }
        }
    }
}

/// Reads everything available past `offset` and appends the complete lines to
/// `lines`. Reads are capped at `MAX_READ_CHUNK_BYTES` per iteration so a
/// large backlog (e.g. a reopened generation read from zero) is never buffered
/// raw in one allocation. A trailing line without its newline stays buffered
/// in `pending` until a later read completes it.
async fn read_lines(
    file: &mut fs::File,
    offset: &mut u64,
    pending: &mut Vec<u8>,
    lines: &mut Vec<String>,
) -> Result<()> {
    file.seek(SeekFrom::Start(*offset))
        .await
        .with_context(|| format!("failed to seek log file to offset {offset}"))?;

    loop {
        let mut chunk = Vec::new();
        let read = (&mut *file)
            .take(MAX_READ_CHUNK_BYTES)
            .read_to_end(&mut chunk)
            .await
            .context("failed to read appended log data")?;
        if read == 0 {
            return Ok(());
        }
        *offset += read as u64;
        pending.extend_from_slice(&chunk);

        while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if (read as u64) < MAX_READ_CHUNK_BYTES {
            return Ok(());
        }
    }
}
