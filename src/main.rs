use anyhow::{Context, Result};
use std::sync::Arc;

use kwork_tracker_bot::api::{KworkClient, RequestProfile};
use kwork_tracker_bot::control::{self, ControlState};
use kwork_tracker_bot::core::{self, Component, Config, HealthChecker};
use kwork_tracker_bot::crypto::Vault;
use kwork_tracker_bot::notify::{ListingLinks, TelegramNotifier};
use kwork_tracker_bot::storage::SqliteStore;
use kwork_tracker_bot::tracking::{Tracker, TrackerParts};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    core::logging::init_logging(&config.monitoring.log_level);

    tracing::info!("🚀 Kwork listing tracker starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Marketplace: {}", config.marketplace.base_url);

    let health = HealthChecker::new();

    let store = SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("opening session store at {}", config.database.url))?;
    health.report(Component::Database, store.ping().await).await;

    let vault = Arc::new(load_vault(&config).await?);
    health.report(Component::Vault, true).await;

    let marketplace = KworkClient::new(
        &config.marketplace.base_url,
        &RequestProfile::default(),
        config.marketplace.request_timeout(),
    )?;
    let notifier = TelegramNotifier::new(
        &config.telegram.api_url,
        &config.telegram.bot_token,
        config.marketplace.request_timeout(),
    )?;

    let tracker = Arc::new(Tracker::new(TrackerParts {
        links: ListingLinks::new(marketplace.base_url()),
        marketplace: Arc::new(marketplace),
        notifier: Arc::new(notifier),
        store: Arc::new(store),
        vault,
        poll_interval: config.tracking.poll_interval(),
        health: health.clone(),
    }));

    let resumed = tracker.resume().await?;
    tracing::info!(
        "✅ Tracker ready: {} user(s) resumed, polling every {:?}",
        resumed,
        config.tracking.poll_interval()
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let state = ControlState {
        tracker: tracker.clone(),
        health,
    };
    let port = config.monitoring.control_port;
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        if let Err(e) = control::serve(state, port, shutdown).await {
            tracing::error!("Control API failed: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("🛑 Shutdown requested");

    let _ = stop_tx.send(());
    tracker.shutdown().await;
    if let Err(e) = server.await {
        tracing::error!("Control API task ended abnormally: {}", e);
    }

    tracing::info!("👋 Tracker stopped");
    Ok(())
}

/// RSA key generation is CPU-bound; keep it off the async workers.
async fn load_vault(config: &Config) -> Result<Vault> {
    let vault_config = config.vault.clone();

    tokio::task::spawn_blocking(move || -> Result<Vault> {
        let mut vault = Vault::load_or_create(&vault_config.key_dir, vault_config.key_bits)
            .with_context(|| format!("loading vault keys from {}", vault_config.key_dir.display()))?;

        if vault_config.rotate_on_start {
            vault.rotate(vault_config.key_bits)?;
            vault.persist(&vault_config.key_dir)?;
        }

        tracing::info!(
            "🔐 Vault ready: versions {:?}, current v{}",
            vault.versions(),
            vault.current_version()
        );
        Ok(vault)
    })
    .await
    .context("vault loader panicked")?
}
