//! HTLC Relayer - atomic swaps between an EVM chain and Aptos
//!
//! Watches the HTLC contracts on both chains, mirrors each user's lock with a
//! relayer lock on the other chain, claims the user's lock once the recipient
//! reveals the secret, and refunds both legs after they expire.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
mod swap;
#[cfg(test)]
mod testing;
mod tx;

use chain::aptos::{AptosClient, AptosHtlcAdapter, AptosSigner, AptosWatcher};
use chain::evm::{EvmHtlcAdapter, EvmProvider, EvmWatcher};
use chain::{ChainAdapters, ChainManager, ChainWatcher, HtlcAdapter};
use config::{LoggingConfig, Settings};
use coordination::{Coordinator, CoordinatorSettings, SystemClock};
use metrics::MetricsServer;
use state::{InMemorySwapStore, StateManager, SwapStore};
use tx::TransactionSender;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!(
        "Starting HTLC Relayer v{} ({})",
        env!("CARGO_PKG_VERSION"),
        settings.relayer.instance_id
    );

    // Initialize swap store
    let store = open_store(&settings).await?;

    let (events_tx, events_rx) = mpsc::channel(settings.relayer.event_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let confirmation_timeout = Duration::from_secs(settings.relayer.confirmation_timeout_secs);

    // EVM side
    let provider = Arc::new(EvmProvider::new(settings.evm.clone())?);
    let wallet = TransactionSender::load_wallet(&settings.evm.private_key_env)?;
    let sender = Arc::new(TransactionSender::new(
        provider.clone(),
        wallet,
        &settings.relayer,
    ));
    let evm_adapter: Arc<dyn HtlcAdapter> =
        Arc::new(EvmHtlcAdapter::new(provider.clone(), sender));
    let evm_watcher: Arc<dyn ChainWatcher> = Arc::new(EvmWatcher::new(
        &settings.evm,
        provider,
        store.clone(),
        events_tx.clone(),
    ));

    // Aptos side
    let aptos_client = Arc::new(
        AptosClient::new(&settings.aptos.node_url, confirmation_timeout)
            .context("Failed to build Aptos client")?,
    );
    let aptos_signer = AptosSigner::from_env(&settings.aptos.private_key_env)?;
    info!("Aptos relayer account: {}", aptos_signer.address());
    let aptos_adapter: Arc<dyn HtlcAdapter> = Arc::new(AptosHtlcAdapter::new(
        aptos_client.clone(),
        aptos_signer,
        &settings.aptos,
        confirmation_timeout,
    ));
    let aptos_watcher: Arc<dyn ChainWatcher> = Arc::new(AptosWatcher::new(
        &settings.aptos,
        aptos_client,
        store.clone(),
        events_tx,
    ));

    let adapters = ChainAdapters::new(evm_adapter, aptos_adapter);
    let chain_manager = Arc::new(ChainManager::new(
        adapters.clone(),
        vec![evm_watcher, aptos_watcher],
    ));
    info!("Chain connections initialized");

    // Initialize coordinator
    let coordinator = Coordinator::new(
        store.clone(),
        adapters,
        Arc::new(SystemClock),
        CoordinatorSettings::from(&settings.relayer),
    );
    info!("Swap coordinator initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            store: store.clone(),
            coordinator: coordinator.clone(),
            chain_manager: chain_manager.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.api.host.clone(), settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start chain watchers
    let watcher_handles = chain_manager.start_watchers(shutdown_rx.clone());

    // Start coordinator
    let coordinator_handle = tokio::spawn(coordinator.run(events_rx, shutdown_rx));

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = Duration::from_secs(settings.relayer.health_check_interval_secs.max(1));
        async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut healthy = true;
                for (chain, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Chain {} health check failed", chain);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Swap store health check failed: {}", e);
                    healthy = false;
                }

                metrics::record_health_check(healthy);
            }
        }
    });

    info!("HTLC Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!(
            "Metrics: http://{}:{}/metrics",
            settings.api.host, settings.metrics.port
        );
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: watchers and coordinator observe the flag
    let _ = shutdown_tx.send(true);
    let stopping = async {
        for handle in watcher_handles {
            let _ = handle.await;
        }
        let _ = coordinator_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, stopping).await.is_err() {
        warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Relayer stopped");
    Ok(())
}

/// `memory://` selects the volatile store; anything else is a Postgres URL
async fn open_store(settings: &Settings) -> Result<Arc<dyn SwapStore>> {
    if settings.database.url.starts_with("memory://") {
        warn!("Using in-memory swap store; swaps are lost on restart");
        return Ok(Arc::new(InMemorySwapStore::new()));
    }

    let state_manager = StateManager::new(&settings.database).await?;
    info!("Database connection established");

    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    Ok(Arc::new(state_manager))
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_relayer=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
