//! # parley-server
//!
//! Store-and-forward relay for the Parley messenger.
//!
//! This binary provides:
//! - **WebSocket endpoint** carrying the bincode client/server frames
//! - **Presence directory** mapping each identity to its one live connection
//! - **Durable message log** (SQLite) with per-recipient delivery state
//! - **Offline queue flush** replaying undelivered messages on login

mod auth;
mod config;
mod delivery;
mod error;
mod presence;
mod session;
mod state;
mod ws;

use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::auth::StoreResolver;
use crate::config::ServerConfig;
use crate::state::RelayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        addr = %config.http_addr,
        registration_open = config.registration_open,
        "Loaded configuration"
    );

    let db = match &config.db_path {
        Some(path) => Database::open_relay_at(path)?,
        None => Database::open_relay()?,
    };
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Relay log open");
    }

    let store = Arc::new(Mutex::new(db));
    let resolver = Box::new(StoreResolver::new(store.clone(), config.registration_open));
    let state = Arc::new(RelayState::new(config, store, resolver));

    tokio::select! {
        result = ws::serve(state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
