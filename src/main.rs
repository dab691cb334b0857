mod archive;
mod classify;
mod config;
mod elastic;
mod log_parser;
mod metadata;
mod monitor;
mod processor;
mod scanner;
mod tailer;
mod telegram;

use anyhow::{Context, Result};
use archive::ArchiveManager;
use config::Config;
use elastic::{ElasticsearchSink, MetadataSink};
use metadata::ExifExtractor;
use monitor::Monitor;
use processor::{FileProcessor, RetryPolicy};
use std::sync::Arc;
use telegram::TelegramClient;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_ENV: &str = "TRAILCAM_RELAY_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    config
        .ensure_directories()
        .context("failed to create working directories")?;

    let http = reqwest::Client::new();
    let delivery = Arc::new(TelegramClient::new(
        http.clone(),
        config.telegram.api_base.clone(),
        config.telegram.bot_token.clone(),
        config.telegram.chat_id.clone(),
    ));
    let sink: Option<Arc<dyn MetadataSink>> = match &config.elasticsearch {
        Some(es) => {
            info!(host = %es.host, index = %es.index, "metadata indexing enabled");
            Some(Arc::new(ElasticsearchSink::new(
                http,
                es.host.clone(),
                es.index.clone(),
                &es.api_key_id,
                &es.api_key_value,
            )))
        }
        None => {
            info!("no elasticsearch configuration; metadata indexing disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let processor = Arc::new(FileProcessor::new(
        delivery,
        Arc::new(ExifExtractor),
        sink,
        ArchiveManager::new(config.processed_dir(), config.failed_dir()),
        RetryPolicy::from_config(&config.delivery),
        config.fallback_locations.clone(),
        cancel.clone(),
    ));

    info!("trailcam-relay started");

    // Catch-up pass for files that arrived before the process did.
    if let Err(err) = scanner::scan_directory(&config.files_dir(), &processor).await {
        warn!(error = %err, "startup catch-up scan failed");
    }

    let monitor = Monitor::new(
        config.log_file_path(),
        config.files_dir(),
        config.poll_interval(),
        processor,
        cancel,
    );
    monitor.run().await?;

    info!("trailcam-relay stopped");
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        error!(error = %err, "failed while waiting for shutdown signal");
                    }
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        error!(error = %err, "failed while waiting for shutdown signal");
                    }
                    info!("interrupt received; shutting down");
                }
                _ = sigterm.recv() => {
                    info!("termination signal received; shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("interrupt received; shutting down");
        }
        cancel.cancel();
    });
}
