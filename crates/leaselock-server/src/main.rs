//! Inventory demo server for the leaselock engine.
//!
//! Every reduce endpoint runs the same read-decrement-write critical section
//! against a shared stock counter, each under a different protection level:
//! - /reduce/local - process-local mutex
//! - /reduce/fixed-ttl - store lock with a fixed lease, unconditional release
//! - /reduce/owner-checked - fixed lease, release only by the owner
//! - /reduce/renewed - bounded wait, watchdog renewal, scoped release

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use leaselock_core::{MemoryStore, StoreClient};
use leaselock_redis::RedisStore;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod handlers;
mod inventory;

use config::{Config, StoreBackend};
use handlers::{
    get_stock, health_handler, put_stock, reduce_fixed_ttl, reduce_local, reduce_owner_checked,
    reduce_renewed, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting leaselock-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Store: {}", config.store);
    info!("  Lock key: {}", config.lock_key);
    info!(
        "  Lease: {}ms, wait: {}ms, max work: {}ms",
        config.lease_ttl_ms, config.wait_timeout_ms, config.max_work_ms
    );

    let store: Arc<dyn StoreClient> = match config.store {
        StoreBackend::Memory => {
            warn!("  Memory store: locks only cover this process");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            info!("  Redis: {}", config.redis_url);
            Arc::new(RedisStore::connect(&config.redis_url).await?)
        }
    };

    let state = AppState::new(store, &config)?;

    if let Some(stock) = config.initial_stock {
        state.inventory.seed(stock).await?;
    }

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/stock", get(get_stock).put(put_stock))
        .route("/reduce/local", post(reduce_local))
        .route("/reduce/fixed-ttl", post(reduce_fixed_ttl))
        .route("/reduce/owner-checked", post(reduce_owner_checked))
        .route("/reduce/renewed", post(reduce_renewed))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
