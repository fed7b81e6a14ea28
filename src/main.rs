//! Warehouse Server
//!
//! A self-hosted multi-tenant inventory server. Mobile and desktop clients
//! work offline and reconcile through delta pulls and batch pushes.

use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod context;
mod db;
mod entities;
mod error;
mod routes;
mod state;
mod sync;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warehouse_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Warehouse Server v{}", env!("CARGO_PKG_VERSION"));

    let db_pool = db::create_pool(&config.database)
        .await
        .context("failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let sweeper = match config.sync.tombstone_sweep_interval_secs {
        0 => {
            tracing::info!("Tombstone sweep disabled");
            None
        }
        secs => {
            tracing::info!(
                "Sweeping tombstones older than {} days every {}s",
                config.sync.tombstone_retention_days,
                secs
            );
            Some(sync::spawn_retention_sweep(
                db_pool.clone(),
                config.sync.tombstone_retention_days,
                Duration::from_secs(secs),
            ))
        }
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = routes::app(AppState::new(config, db_pool.clone()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Warehouse Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    db_pool.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
