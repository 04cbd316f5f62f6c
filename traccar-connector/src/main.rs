use anyhow::{Context, Result};
use fleet_sync::{ConnectionStatus, SyncEngine};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use traccar_connector::{AppConfig, SqliteStore, TraccarClient, WebSocketTransport};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_sync=info,traccar_connector=info,traccar_sync=info".into()),
        )
        .init();

    info!("Fleet sync starting...");

    let config_path =
        std::env::var("FLEET_SYNC_CONFIG").unwrap_or_else(|_| "fleet-sync.toml".to_string());
    let config = AppConfig::load(&config_path).context("Failed to load configuration")?;
    config
        .traccar
        .validate()
        .context("Invalid Traccar configuration")?;

    info!(
        config_path = %config_path,
        base_url = %config.traccar.base_url,
        snapshot_db = %config.traccar.snapshot_db,
        circuit_threshold = config.sync.backoff.circuit_threshold,
        poll_base_secs = config.sync.poller.base_interval_secs,
        "Configuration loaded"
    );

    let client = Arc::new(
        TraccarClient::new(&config.traccar).context("Failed to initialize Traccar client")?,
    );
    let store = Arc::new(
        SqliteStore::new(&config.traccar.snapshot_db)
            .context("Failed to initialize snapshot store")?,
    );
    let transport = Arc::new(WebSocketTransport::new(Arc::clone(&client)));

    let engine = SyncEngine::start(config.sync.clone(), transport, client, store);
    info!(
        entities = engine.initial_diff().created.len(),
        "Initial view ready"
    );

    let mut diffs = engine.subscribe_diffs();
    let diff_logger = tokio::spawn(async move {
        loop {
            match diffs.recv().await {
                Ok(diff) => info!(
                    created = diff.created.len(),
                    modified = diff.modified.len(),
                    removed = diff.removed.len(),
                    reused = diff.reused.len(),
                    efficiency = diff.efficiency,
                    "View updated"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Diff logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut connection = engine.connection();
    let state_logger = tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let state = connection.borrow_and_update().clone();
            match state.status {
                ConnectionStatus::Disconnected if state.is_fatal() => {
                    let reason = state
                        .last_error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_default();
                    error!(error = %reason, "Stream stopped, check server URL and credentials");
                }
                ConnectionStatus::Disconnected if state.circuit_open => {
                    warn!(
                        retry_count = state.retry_count,
                        "Stream unavailable, circuit open, polling until cooldown ends"
                    );
                }
                status => info!(
                    status = %status,
                    retry_count = state.retry_count,
                    "Connection state changed"
                ),
            }
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    engine.dispose().await;
    diff_logger.abort();
    state_logger.abort();

    let stats = engine.cache().stats();
    info!(
        entities = stats.size,
        hits = stats.hits,
        misses = stats.misses,
        "Fleet sync stopped"
    );

    Ok(())
}
