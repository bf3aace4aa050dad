//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the chat protocol listener (JSON lines over TCP).
    /// Env: `CHIFFRE_CHAT_ADDR`
    /// Default: `0.0.0.0:7878`
    pub chat_addr: SocketAddr,

    /// Socket address for the HTTP (axum) health/stats sidecar.
    /// Env: `CHIFFRE_HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `CHIFFRE_DB_PATH`
    /// Default: `./chiffre.db`
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_addr: ([0, 0, 0, 0], 7878).into(),
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: PathBuf::from("./chiffre.db"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CHIFFRE_CHAT_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.chat_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "Invalid CHIFFRE_CHAT_ADDR, using default");
                }
            }
        }

        if let Ok(addr) = std::env::var("CHIFFRE_HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "Invalid CHIFFRE_HTTP_ADDR, using default");
                }
            }
        }

        if let Ok(path) = std::env::var("CHIFFRE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
