use crate::metadata::GeoPoint;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchConfig>,
    pub paths: PathsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Static per-device coordinates used when a photo carries no GPS data.
    #[serde(default)]
    pub fallback_locations: HashMap<String, GeoPoint>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    pub host: String,
    pub index: String,
    pub api_key_id: String,
    pub api_key_value: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub log_file: String,
    pub files_dir: String,
    pub processed_dir: String,
    pub failed_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Total delivery attempts per file, rate-limited attempts included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Safety margin added on top of a server-supplied retry-after hint.
    #[serde(default = "default_rate_limit_margin_secs")]
    pub rate_limit_margin_secs: u64,
    /// Wait used when a 429 body carries no parseable hint.
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
}

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_RATE_LIMIT_MARGIN_SECS: u64 = 5;
const DEFAULT_RATE_LIMIT_FALLBACK_SECS: u64 = 35;

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_rate_limit_margin_secs() -> u64 {
    DEFAULT_RATE_LIMIT_MARGIN_SECS
}

fn default_rate_limit_fallback_secs() -> u64 {
    DEFAULT_RATE_LIMIT_FALLBACK_SECS
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            rate_limit_margin_secs: DEFAULT_RATE_LIMIT_MARGIN_SECS,
            rate_limit_fallback_secs: DEFAULT_RATE_LIMIT_FALLBACK_SECS,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)?;
        if config.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token cannot be empty");
        }
        if config.telegram.chat_id.trim().is_empty() {
            anyhow::bail!("telegram.chat_id cannot be empty");
        }
        if config.delivery.max_attempts == 0 {
            anyhow::bail!("delivery.max_attempts must be at least 1");
        }
        if let Some(es) = &config.elasticsearch {
            if es.host.trim().is_empty() || es.index.trim().is_empty() {
                anyhow::bail!("elasticsearch configuration requires host and index");
            }
        }
        Ok(config)
    }

    pub fn log_file_path(&self) -> PathBuf {
        expand(&self.paths.log_file)
    }

    pub fn files_dir(&self) -> PathBuf {
        expand(&self.paths.files_dir)
    }

    pub fn processed_dir(&self) -> PathBuf {
        expand(&self.paths.processed_dir)
    }

    pub fn failed_dir(&self) -> PathBuf {
        expand(&self.paths.failed_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }

    /// Creates the watched and archive directories up front. Failing here is an
    /// unrecoverable startup condition.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.files_dir(), self.processed_dir(), self.failed_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
            [telegram]
            bot_token = "token"
            chat_id = "42"

            [paths]
            log_file = "/var/log/vsftpd.log"
            files_dir = "/srv/camera"
            processed_dir = "/srv/camera/processed"
            failed_dir = "/srv/camera/failed"
        "#
        .to_string()
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).expect("config should parse");
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.delivery.retry_delay_ms, 2_000);
        assert_eq!(config.watcher.poll_interval_ms, 5_000);
        assert!(config.elasticsearch.is_none());
        assert!(config.fallback_locations.is_empty());
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
    }

    #[test]
    fn parses_fallback_locations_table() {
        let raw = format!(
            "{}\n[fallback_locations.CAM7]\nlat = 59.33\nlon = 18.07\n",
            minimal_toml()
        );
        let config: Config = toml::from_str(&raw).expect("config should parse");
        let point = config
            .fallback_locations
            .get("CAM7")
            .expect("CAM7 should be present");
        assert!((point.lat - 59.33).abs() < f64::EPSILON);
        assert!((point.lon - 18.07).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_empty_bot_token() {
        let raw = minimal_toml().replace("\"token\"", "\"\"");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, raw).expect("write config");
        assert!(Config::load(&path).is_err());
    }
}
