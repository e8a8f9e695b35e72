//! Switchboard Coordinator
//!
//! The coordinator is the control point of a worker pool. It tracks worker
//! liveness, maintains the service directory, elects the heartbeat leader,
//! and proxies client requests to healthy workers.

use std::sync::Arc;

use anyhow::Result;
use swb_coordinator::{
    api,
    config::{Config, StoreBackend},
    coordinators::CoordinatorRegistry,
    proxy::Proxy,
    registry::{Registry, RegistryConfig},
    state::AppState,
    store::{KvStore, MemoryStore, PgStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SWB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting switchboard coordinator");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Connect the backing store
    let store: Arc<dyn KvStore> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store, state will not survive restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            let store = match PgStore::connect(&config.postgres).await {
                Ok(store) => {
                    info!("Store connection established");
                    store
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to store");
                    return Err(e.into());
                }
            };

            // Run migrations in dev mode
            if config.dev_mode {
                info!("Running store migrations (dev mode)");
                if let Err(e) = store.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            Arc::new(store)
        }
    };

    // Cold-load persisted registry state
    let registry = Registry::load(
        store.clone(),
        RegistryConfig {
            staleness: config.windows.staleness,
            persist_throttle: config.windows.persist_throttle,
            heartbeat_interval: config.windows.heartbeat_interval,
        },
    )
    .await?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the regional coordinator registry actor
    let (coordinators, coordinators_handle) = CoordinatorRegistry::spawn(
        store.clone(),
        config.windows.coordinator_activity,
        shutdown_rx.clone(),
    )
    .await?;

    let proxy = Proxy::new(config.windows.proxy_timeout)?;

    // Create application state
    let state = AppState::new(registry, coordinators, proxy, store);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to background tasks
    let _ = shutdown_tx.send(true);

    info!("Waiting for background tasks to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, coordinators_handle).await {
        warn!(error = %e, "Coordinator registry did not shut down in time");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
