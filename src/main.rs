mod api;
mod callback;
mod config;
mod groups;
mod ingest;
mod media;
mod payload;
mod platform;
mod sender;
#[cfg(test)]
mod testing;
mod typing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::ApiState;
use crate::config::Config;
use crate::ingest::IngestionLoop;
use crate::platform::telegram::TelegramTransport;
use crate::platform::Transport;
use crate::sender::Sender;
use crate::typing::TypingRegistry;

/// Inbound messages buffered between the update listener and the ingestion loop.
const INBOUND_CAPACITY: usize = 256;

fn load_config() -> Result<Config> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env().context("Failed to load config from environment")?
        }
    };
    config.validate()?;
    Ok(config)
}

/// Stop accepting work, then tear down. API requests are drained before the
/// typing registry is emptied so none can start a task after teardown.
async fn shutdown(
    stop: CancellationToken,
    api_task: JoinHandle<Result<()>>,
    ingest_task: JoinHandle<()>,
    ingest: &IngestionLoop,
) {
    stop.cancel();
    match api_task.await {
        Ok(Err(e)) => error!("Command API failed: {:#}", e),
        Err(e) => error!("Command API task ended abnormally: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = ingest_task.await {
        error!("Ingestion loop ended abnormally: {}", e);
    }

    ingest.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;

    info!("Configuration loaded successfully");
    info!("  Callback URL: {}", config.callback.url);
    info!(
        "  Callback: timeout {}s, {} attempt(s)",
        config.callback.timeout_secs, config.callback.retries
    );
    info!(
        "  Media download: {} (max {} MB, types: {})",
        config.media.enable_download, config.media.max_size_mb, config.media.download_types
    );
    info!("  Media group timeout: {}s", config.media.group_timeout_secs);
    info!("  Command API: {}", config.api.listen);

    let telegram = Arc::new(TelegramTransport::new(&config.telegram.bot_token));
    let transport: Arc<dyn Transport> = telegram.clone();

    let typing = Arc::new(TypingRegistry::new(
        transport.clone(),
        config.typing.refresh_interval(),
    ));
    let ingest = Arc::new(IngestionLoop::new(transport.clone(), &config, typing.clone()));
    let api_state = ApiState {
        typing,
        sender: Arc::new(Sender::new(transport)?),
    };

    ingest.start().await;

    let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);
    let listener = telegram.listen(events_tx).await;

    let stop = CancellationToken::new();
    let api_listener = api::bind(config.api.listen).await?;
    let api_task = tokio::spawn(api::serve(api_listener, api_state, stop.clone()));

    let ingest_task = {
        let ingest = ingest.clone();
        let stop = stop.clone();
        tokio::spawn(async move { ingest.run(events_rx, stop).await })
    };

    info!("Bot is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown(stop, api_task, ingest_task, &ingest).await;

    if let Err(e) = listener.await {
        error!("Update listener ended abnormally: {}", e);
    }

    Ok(())
}
