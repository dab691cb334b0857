use crate::metadata::GeoPoint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

/// One ECS-shaped capture record per forwarded photo.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub device_id: String,
    /// Capture time from EXIF when available, otherwise the processing time.
    pub taken_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub geo: Option<GeoPoint>,
    pub file_name: String,
}

/// Indexing is best effort: the processor logs failures and carries on,
/// delivery is never blocked on the sink.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn ingest(&self, record: &CaptureRecord) -> Result<()>;
}

pub struct ElasticsearchSink {
    http: reqwest::Client,
    host: String,
    index: String,
    api_key: String,
}

impl ElasticsearchSink {
    pub fn new(
        http: reqwest::Client,
        host: String,
        index: String,
        api_key_id: &str,
        api_key_value: &str,
    ) -> Self {
        let api_key = BASE64_STANDARD.encode(format!("{api_key_id}:{api_key_value}"));
        Self {
            http,
            host,
            index,
            api_key,
        }
    }
}

#[async_trait]
impl MetadataSink for ElasticsearchSink {
    async fn ingest(&self, record: &CaptureRecord) -> Result<()> {
        let mut document = json!({
            "device": { "id": record.device_id },
            "@timestamp": record.taken_at.to_rfc3339(),
            "event": { "ingested": record.ingested_at.to_rfc3339() },
            "file": { "name": record.file_name },
        });
        if let Some(geo) = &record.geo {
            document["geo"] = json!({ "location": { "lat": geo.lat, "lon": geo.lon } });
        }

        let url = format!("{}/{}/_doc", self.host.trim_end_matches('/'), self.index);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("ApiKey {}", self.api_key))
            .json(&document)
            .send()
            .await
            .context("failed to reach elasticsearch")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("elasticsearch returned {status}: {body}");
        }

        debug!(
            device_id = %record.device_id,
            file_name = %record.file_name,
            "metadata ingested into elasticsearch"
        );
        Ok(())
    }
}
