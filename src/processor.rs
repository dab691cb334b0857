use crate::archive::{ArchiveManager, ArchiveOutcome};
use crate::classify::{classify, FileKind};
use crate::config::DeliveryConfig;
use crate::elastic::{CaptureRecord, MetadataSink};
use crate::metadata::{device_id, GeoPoint, MetadataExtractor, PhotoMetadata};
use crate::telegram::{Delivery, DeliveryOutcome};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts per file. Rate-limited attempts count toward
    /// this ceiling so a throttling endpoint cannot block the worker forever.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub rate_limit_margin: Duration,
    pub rate_limit_fallback: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            rate_limit_margin: Duration::from_secs(config.rate_limit_margin_secs),
            rate_limit_fallback: Duration::from_secs(config.rate_limit_fallback_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Delivered and archived as processed.
    Delivered,
    /// Retry budget exhausted; archived as failed.
    Exhausted,
    /// Unsupported kind; file deliberately left in place.
    Skipped,
    /// Shutdown fired mid-processing; file left in place, nothing resumes on
    /// restart.
    Aborted,
}

/// Drives one file to a terminal archive location:
/// classify, extract and index metadata for photos, deliver with bounded
/// retries, archive by outcome.
pub struct FileProcessor {
    delivery: Arc<dyn Delivery>,
    extractor: Arc<dyn MetadataExtractor>,
    sink: Option<Arc<dyn MetadataSink>>,
    archive: ArchiveManager,
    retry: RetryPolicy,
    fallback_locations: HashMap<String, GeoPoint>,
    cancel: CancellationToken,
}

impl FileProcessor {
    pub fn new(
        delivery: Arc<dyn Delivery>,
        extractor: Arc<dyn MetadataExtractor>,
        sink: Option<Arc<dyn MetadataSink>>,
        archive: ArchiveManager,
        retry: RetryPolicy,
        fallback_locations: HashMap<String, GeoPoint>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            delivery,
            extractor,
            sink,
            archive,
            retry,
            fallback_locations,
            cancel,
        }
    }

    pub async fn process(&self, path: &Path) -> ProcessOutcome {
        let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
            warn!(path = %path.display(), "file has no usable name; skipping");
            return ProcessOutcome::Skipped;
        };
        let Some(kind) = classify(filename) else {
            warn!(filename, "unsupported file type; leaving file in place");
            return ProcessOutcome::Skipped;
        };

        info!(filename, ?kind, "processing file");

        if kind == FileKind::Photo {
            self.index_photo(path, filename).await;
        }

        let delivered = match self.deliver_with_retries(path, kind, filename).await {
            Some(delivered) => delivered,
            None => {
                info!(filename, "shutdown during delivery; leaving file in place");
                return ProcessOutcome::Aborted;
            }
        };

        let archive_outcome = if delivered {
            ArchiveOutcome::Processed
        } else {
            ArchiveOutcome::Failed
        };
        if let Err(err) = self.archive.move_file(path, archive_outcome).await {
            // No automatic retry of the move; the file stays put for an
            // operator to deal with.
            error!(
                error = %err,
                path = %path.display(),
                "failed to archive file; leaving it in place"
            );
        }

        if delivered {
            ProcessOutcome::Delivered
        } else {
            ProcessOutcome::Exhausted
        }
    }

    /// Returns `Some(true)` on delivery, `Some(false)` on exhaustion, `None`
    /// when cancelled mid-wait.
    async fn deliver_with_retries(
        &self,
        path: &Path,
        kind: FileKind,
        filename: &str,
    ) -> Option<bool> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.delivery.send(path, kind, filename).await {
                DeliveryOutcome::Delivered => {
                    info!(filename, attempts, "file delivered");
                    return Some(true);
                }
                DeliveryOutcome::RateLimited { retry_after } => {
                    // The hint comes straight off the wire; saturate, never overflow.
                    let wait = match retry_after {
                        Some(hint) => hint.saturating_add(self.retry.rate_limit_margin),
                        None => self.retry.rate_limit_fallback,
                    };
                    warn!(
                        filename,
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        wait_secs = wait.as_secs(),
                        hinted = retry_after.is_some(),
                        "delivery rate limited"
                    );
                    if attempts >= self.retry.max_attempts {
                        error!(filename, attempts, "retry budget exhausted while rate limited");
                        return Some(false);
                    }
                    if sleep_or_cancel(wait, &self.cancel).await {
                        return None;
                    }
                }
                DeliveryOutcome::Failed { reason } => {
                    warn!(
                        filename,
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        reason,
                        "delivery attempt failed"
                    );
                    if attempts >= self.retry.max_attempts {
                        error!(filename, attempts, "retry budget exhausted");
                        return Some(false);
                    }
                    if sleep_or_cancel(self.retry.retry_delay, &self.cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Best-effort metadata extraction and indexing. Nothing here can fail the
    /// file: extraction errors yield empty metadata, missing coordinates skip
    /// the index write, and sink errors are logged and ignored.
    async fn index_photo(&self, path: &Path, filename: &str) {
        let Some(sink) = &self.sink else {
            return;
        };

        let extractor = self.extractor.clone();
        let owned_path = path.to_path_buf();
        let metadata = match task::spawn_blocking(move || extractor.extract(&owned_path)).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, filename, "metadata extraction task failed");
                PhotoMetadata::default()
            }
        };

        let device = device_id(filename).to_string();
        let geo = metadata
            .geo
            .or_else(|| self.fallback_locations.get(&device).copied());
        let Some(geo) = geo else {
            debug!(filename, device, "no coordinates available; skipping indexing");
            return;
        };

        let now = Utc::now();
        let record = CaptureRecord {
            device_id: device,
            taken_at: metadata.taken_at.unwrap_or(now),
            ingested_at: now,
            geo: Some(geo),
            file_name: filename.to_string(),
        };
        if let Err(err) = sink.ingest(&record).await {
            warn!(
                error = %err,
                filename,
                "failed to ingest metadata; continuing with delivery"
            );
        }
    }
}

/// Returns true if the token fired before the sleep completed.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = sleep(duration) => false,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::TimeZone;

    fn no_metadata() -> StaticExtractor {
        StaticExtractor(PhotoMetadata::default())
    }

    #[tokio::test]
    async fn unsupported_kind_is_left_in_place_without_delivery() {
        let (fixture, processor) =
            fixture(vec![], no_metadata(), false, 3, HashMap::new());
        let path = fixture.write_file("notes.txt");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Skipped);
        assert!(path.exists());
        assert_eq!(fixture.delivery.call_count(), 0);
        assert!(fixture.processed_entries().is_empty());
        assert!(fixture.failed_entries().is_empty());
    }

    #[tokio::test]
    async fn exhausting_retries_makes_exactly_max_attempts_then_fails_archive() {
        let (fixture, processor) =
            fixture(vec![], no_metadata(), false, 3, HashMap::new());
        let path = fixture.write_file("CAM1-001.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Exhausted);
        assert_eq!(fixture.delivery.call_count(), 3);
        assert!(!path.exists());
        assert!(fixture.processed_entries().is_empty());
        assert_eq!(fixture.failed_entries().len(), 1);
    }

    #[tokio::test]
    async fn successful_delivery_archives_as_processed() {
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::Delivered],
            no_metadata(),
            false,
            3,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM1-001.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);
        assert_eq!(fixture.delivery.call_count(), 1);
        assert!(!path.exists());
        assert_eq!(fixture.processed_entries().len(), 1);
        assert!(fixture.failed_entries().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_attempts_count_toward_the_ceiling() {
        let (fixture, processor) = fixture(
            vec![
                DeliveryOutcome::RateLimited { retry_after: None },
                DeliveryOutcome::Delivered,
            ],
            no_metadata(),
            false,
            3,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM1-002.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);
        assert_eq!(fixture.delivery.call_count(), 2);
    }

    #[tokio::test]
    async fn sustained_rate_limiting_still_terminates() {
        let (fixture, processor) = fixture(
            vec![
                DeliveryOutcome::RateLimited {
                    retry_after: Some(Duration::ZERO),
                },
                DeliveryOutcome::RateLimited { retry_after: None },
            ],
            no_metadata(),
            false,
            2,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM1-003.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Exhausted);
        assert_eq!(fixture.delivery.call_count(), 2);
        assert_eq!(fixture.failed_entries().len(), 1);
    }

    #[tokio::test]
    async fn absurd_rate_limit_hint_saturates_instead_of_panicking() {
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(u64::MAX)),
            }],
            no_metadata(),
            false,
            1,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM1-005.mp4");

        // The wait is computed before the ceiling check, so even the final
        // attempt must survive a maximal hint.
        assert_eq!(processor.process(&path).await, ProcessOutcome::Exhausted);
        assert_eq!(fixture.delivery.call_count(), 1);
        assert_eq!(fixture.failed_entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hinted_rate_limit_waits_hint_plus_margin() {
        let (fixture, processor) = fixture_with_policy(
            vec![
                DeliveryOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(10)),
                },
                DeliveryOutcome::Delivered,
            ],
            RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_secs(2),
                rate_limit_margin: Duration::from_secs(5),
                rate_limit_fallback: Duration::from_secs(35),
            },
        );
        let path = fixture.write_file("CAM1-006.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);

        let instants = fixture.delivery.call_instants();
        assert_eq!(instants.len(), 2);
        let waited = instants[1] - instants[0];
        assert!(
            waited >= Duration::from_secs(15),
            "waited {waited:?}, expected at least hint + margin"
        );
        assert!(
            waited < Duration::from_secs(35),
            "waited {waited:?}, fallback wait must not apply to a hinted 429"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hintless_rate_limit_waits_the_fixed_fallback() {
        let (fixture, processor) = fixture_with_policy(
            vec![
                DeliveryOutcome::RateLimited { retry_after: None },
                DeliveryOutcome::Delivered,
            ],
            RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_secs(2),
                rate_limit_margin: Duration::from_secs(5),
                rate_limit_fallback: Duration::from_secs(35),
            },
        );
        let path = fixture.write_file("CAM1-007.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);

        let instants = fixture.delivery.call_instants();
        assert_eq!(instants.len(), 2);
        let waited = instants[1] - instants[0];
        assert!(
            waited >= Duration::from_secs(35),
            "waited {waited:?}, expected the fixed fallback"
        );
        assert!(
            waited < Duration::from_secs(36),
            "waited {waited:?}, expected the fixed fallback only"
        );
    }

    #[tokio::test]
    async fn photo_indexing_uses_fallback_coordinates_and_capture_time() {
        let taken_at = Utc.with_ymd_and_hms(2024, 1, 5, 8, 30, 0).unwrap();
        let mut fallback = HashMap::new();
        fallback.insert(
            "CAM7".to_string(),
            GeoPoint {
                lat: 59.33,
                lon: 18.07,
            },
        );
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::Delivered],
            StaticExtractor(PhotoMetadata {
                geo: None,
                taken_at: Some(taken_at),
            }),
            false,
            3,
            fallback,
        );
        let path = fixture.write_file("CAM7-20240105.jpg");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);

        let records = fixture.sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id, "CAM7");
        assert_eq!(records[0].taken_at, taken_at);
        assert_eq!(records[0].file_name, "CAM7-20240105.jpg");
        let geo = records[0].geo.expect("fallback geo should be present");
        assert!((geo.lat - 59.33).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_coordinates_skip_indexing_but_not_delivery() {
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::Delivered],
            no_metadata(),
            false,
            3,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM9-001.jpg");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);
        assert!(fixture.sink.records.lock().unwrap().is_empty());
        assert_eq!(fixture.processed_entries().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_never_blocks_delivery() {
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::Delivered],
            StaticExtractor(PhotoMetadata {
                geo: Some(GeoPoint { lat: 1.0, lon: 2.0 }),
                taken_at: None,
            }),
            true,
            3,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM3-001.jpg");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);
        assert_eq!(fixture.sink.records.lock().unwrap().len(), 1);
        assert_eq!(fixture.processed_entries().len(), 1);
    }

    #[tokio::test]
    async fn videos_are_not_indexed() {
        let (fixture, processor) = fixture(
            vec![DeliveryOutcome::Delivered],
            StaticExtractor(PhotoMetadata {
                geo: Some(GeoPoint { lat: 1.0, lon: 2.0 }),
                taken_at: None,
            }),
            false,
            3,
            HashMap::new(),
        );
        let path = fixture.write_file("CAM3-001.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Delivered);
        assert!(fixture.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_retry_leaves_file_in_place() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (fixture, processor) = fixture_with_cancel(
            vec![],
            no_metadata(),
            false,
            3,
            HashMap::new(),
            cancel,
        );
        let path = fixture.write_file("CAM1-004.mp4");

        assert_eq!(processor.process(&path).await, ProcessOutcome::Aborted);
        assert_eq!(fixture.delivery.call_count(), 1);
        assert!(path.exists());
        assert!(fixture.failed_entries().is_empty());
    }
}
