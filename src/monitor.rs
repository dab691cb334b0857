use crate::log_parser::{parse_line, ParsedLine};
use crate::processor::{FileProcessor, ProcessOutcome};
use crate::tailer::LogTailer;
use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 1000;

/// Wires the filesystem notification source to the log tailer and the file
/// processor. Single logical worker: one notification is handled to completion
/// before the next is taken.
pub struct Monitor {
    log_path: PathBuf,
    files_dir: PathBuf,
    poll_interval: Duration,
    tailer: LogTailer,
    processor: Arc<FileProcessor>,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        log_path: PathBuf,
        files_dir: PathBuf,
        poll_interval: Duration,
        processor: Arc<FileProcessor>,
        cancel: CancellationToken,
    ) -> Self {
        let tailer = LogTailer::new(log_path.clone());
        Self {
            log_path,
            files_dir,
            poll_interval,
            tailer,
            processor,
            cancel,
        }
    }

    /// Runs until the cancellation token fires. The watcher handle must stay
    /// alive for the lifetime of the loop or notifications stop arriving.
    pub async fn run(mut self) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<()>(CHANNEL_CAPACITY);

        let watched_dir = self
            .log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let log_path = self.log_path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => handle_event(&event_tx, &log_path, event),
                Err(err) => error!(error = %err, "file watcher error"),
            },
            NotifyConfig::default().with_poll_interval(self.poll_interval),
        )
        .context("failed to create notify watcher")?;
        watcher
            .watch(&watched_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory {}", watched_dir.display()))?;

        // Prime the tailer so the initial open (seek to end) happens before
        // the first change notification.
        self.drain_log().await;

        info!(
            log = %self.log_path.display(),
            "monitoring log file for upload events"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested; stopping log monitor");
                    break;
                }
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(()) => self.drain_log().await,
                        None => {
                            warn!("watcher channel closed; stopping log monitor");
                            break;
                        }
                    }
                }
            }
        }

        // Dropping the tailer closes the log handle.
        Ok(())
    }

    async fn drain_log(&mut self) {
        let lines = match self.tailer.poll().await {
            Ok(lines) => lines,
            Err(err) => {
                error!(error = %err, log = %self.log_path.display(), "failed to read log file");
                return;
            }
        };

        for line in lines {
            if self.cancel.is_cancelled() {
                return;
            }
            match parse_line(&line) {
                ParsedLine::Upload(event) => {
                    debug!(line = %event.raw_line, "detected upload line");
                    let Some(path) = resolve_upload(&self.files_dir, &event.extracted_path)
                    else {
                        error!(
                            extracted_path = %event.extracted_path,
                            files_dir = %self.files_dir.display(),
                            "uploaded file not found in watched directory"
                        );
                        continue;
                    };
                    if self.processor.process(&path).await == ProcessOutcome::Aborted {
                        return;
                    }
                }
                ParsedLine::MarkerWithoutPath => {
                    warn!(line = %line, "could not extract path from upload line");
                }
                ParsedLine::Unmatched => {}
            }
        }
    }
}

/// Only the basename from the log is used; the uploaded file is expected
/// directly inside the watched directory regardless of what directory the
/// server logged.
fn resolve_upload(files_dir: &Path, extracted_path: &str) -> Option<PathBuf> {
    let basename = Path::new(extracted_path).file_name()?;
    let candidate = files_dir.join(basename);
    candidate.is_file().then_some(candidate)
}

fn handle_event(event_tx: &mpsc::Sender<()>, log_path: &Path, event: Event) {
    if !event.paths.iter().any(|path| path == log_path) {
        return;
    }
    match event_tx.try_send(()) {
        Ok(_) => {}
        Err(TrySendError::Full(_)) => {
            // The pending notification already forces a full drain, so a
            // dropped one loses nothing.
            debug!("notification channel full; coalescing log change event");
        }
        Err(TrySendError::Closed(_)) => {
            warn!("notification channel closed; dropping log change event");
        }
    }
}
