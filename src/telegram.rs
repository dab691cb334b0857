use crate::classify::FileKind;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
// Trailcam clips are always recorded at this size; Telegram wants the
// dimensions up front to render the player correctly.
const VIDEO_WIDTH: &str = "1280";
const VIDEO_HEIGHT: &str = "720";

/// Result of one delivery attempt. The client owns no retry policy; the
/// processor decides what to do with each outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    RateLimited { retry_after: Option<Duration> },
    Failed { reason: String },
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, path: &Path, kind: FileKind, filename: &str) -> DeliveryOutcome;
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_base: String, bot_token: String, chat_id: String) -> Self {
        Self {
            http,
            api_base,
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl Delivery for TelegramClient {
    async fn send(&self, path: &Path, kind: FileKind, filename: &str) -> DeliveryOutcome {
        debug!(filename, ?kind, "sending file to telegram");

        // Reading the bytes up front means no file handle can outlive the
        // request on any exit path.
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return DeliveryOutcome::Failed {
                    reason: format!("failed to read {}: {err}", path.display()),
                }
            }
        };

        let (method, field) = match kind {
            FileKind::Photo => ("sendPhoto", "photo"),
            FileKind::Video => ("sendVideo", "video"),
        };

        let part = Part::bytes(bytes).file_name(filename.to_string());
        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part(field, part);
        if kind == FileKind::Video {
            form = form.text("width", VIDEO_WIDTH).text("height", VIDEO_HEIGHT);
        }

        let url = format!("{}/bot{}/{method}", self.api_base, self.bot_token);
        let response = match self
            .http
            .post(&url)
            .multipart(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::Failed {
                    reason: format!("request error: {err}"),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryOutcome::Delivered;
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // A malformed body still yields the rate-limited outcome; the
            // processor falls back to its fixed wait.
            return DeliveryOutcome::RateLimited {
                retry_after: retry_after_hint(&body),
            };
        }

        DeliveryOutcome::Failed {
            reason: format!("status {status}: {body}"),
        }
    }
}

/// Extracts `parameters.retry_after` (seconds) from a Telegram 429 body.
fn retry_after_hint(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    let seconds = value.get("parameters")?.get("retry_after")?.as_u64()?;
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_from_429_body() {
        let body = r#"{"ok":false,"error_code":429,"parameters":{"retry_after":30}}"#;
        assert_eq!(retry_after_hint(body), Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_bodies_yield_no_hint() {
        assert_eq!(retry_after_hint("not json"), None);
        assert_eq!(retry_after_hint(""), None);
        assert_eq!(retry_after_hint(r#"{"ok":false}"#), None);
        assert_eq!(
            retry_after_hint(r#"{"parameters":{"retry_after":"soon"}}"#),
            None
        );
    }
}
