//! # chiffre-server
//!
//! Server-side authority for the Chiffre end-to-end-encrypted chat service.
//!
//! This binary provides:
//! - **Authentication** with an escalating login-lockout state machine
//! - **Friend graph** management (mutual edges plus pending request edges)
//! - **Public-key brokering** between clients (the server never decrypts)
//! - **Message relay** with store-and-forward queueing for users who are
//!   offline or not actively viewing the sender's chat
//! - **HTTP sidecar** (axum) for health checks and basic stats
//!
//! One tokio task runs per client connection; shared state lives in the
//! session registry and the SQLite store.

mod api;
mod auth;
mod config;
mod dispatcher;
mod error;
mod friends;
mod password;
mod relay;
mod sessions;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use chiffre_store::Store;

use crate::config::ServerConfig;
use crate::dispatcher::ServerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chiffre_server=debug")),
        )
        .init();

    info!("Starting Chiffre server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the store
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let store = Arc::new(Store::open_at(&config.db_path)?);
    let state = Arc::new(ServerState::new(store.clone()));

    // -----------------------------------------------------------------------
    // 3. Spawn the chat listener (runs in background tokio task)
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(config.chat_addr).await?;
    info!(addr = %config.chat_addr, "Chat listener running");

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let conn_id = Uuid::new_v4();
                    debug!(id = %conn_id, peer = %peer, "accepted connection");

                    let span = tracing::info_span!("conn", id = %conn_id, peer = %peer);
                    tokio::spawn(
                        dispatcher::run_connection(accept_state.clone(), stream).instrument(span),
                    );
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    });

    // -----------------------------------------------------------------------
    // 4. Run the HTTP sidecar (blocks until shutdown)
    // -----------------------------------------------------------------------
    let app_state = api::AppState {
        store,
        registry: state.registry.clone(),
    };

    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
