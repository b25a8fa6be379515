//! COOP Server Entry Point
//!
//! Bootstraps configuration, connects storage, and starts the Axum
//! server hosting the WebSocket protocol and HTTP surface.

use std::sync::Arc;

use coop_server::auth::{AuthConfig, AuthManager};
use coop_server::config::ServerConfig;
use coop_server::error::{ServerError, ServerResult};
use coop_server::rate_limit::RateLimitConfig;
use coop_server::{create_router, AppState};
use coop_storage::{create_storage, StorageConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server_config = ServerConfig::from_env()?;
    let auth_config =
        AuthConfig::from_env().map_err(|e| ServerError::new(e.code(), e.to_string()))?;
    let storage_config = StorageConfig::from_env()?;

    let storage = create_storage(&storage_config);
    // A broken storage backend is fatal at startup, not at first use.
    storage.connect().await?;
    tracing::info!(backend = ?storage_config.backend, "storage connected");

    let state = AppState::new(
        Arc::new(AuthManager::new(auth_config)),
        storage,
        RateLimitConfig::from_env(),
        server_config.ws_capacity,
    );
    let app = create_router(Arc::clone(&state));

    let addr = server_config.bind_addr()?;
    tracing::info!(%addr, "starting COOP server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::internal(format!("failed to bind {addr}: {e}")))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ServerError::internal(format!("server error: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    state.storage.disconnect().await?;
    Ok(())
}
