//! Courier relay server.
//!
//! Configuration comes from `COURIER_*` environment variables
//! (`COURIER_BIND_ADDR`, `COURIER_DATA_DIR`, `COURIER_WORKERS`, …).
//! Without `COURIER_DATA_DIR` messages live in memory only.

use log::{error, info};
use std::sync::Arc;

use courier_relay::{Relay, RelayConfig, RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let relay_config = RelayConfig::from_env();
    let server_config = ServerConfig::from_env();

    match &relay_config.storage {
        Some(store) => info!("Persisting messages under {}", store.path.display()),
        None => info!("COURIER_DATA_DIR not set, messages are kept in memory"),
    }

    let relay = match Relay::open(relay_config) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!("Failed to open relay: {e}");
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(server_config, relay.clone());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    relay.shutdown().await;
}
