//! Scriblepad relay: serves rooms over WebSocket.
//!
//! Environment:
//! - `SCRIBLEPAD_BIND`: listen address (default `127.0.0.1:1999`)
//! - `SCRIBLEPAD_DATA`: RocksDB directory; rooms are in-memory when unset
//! - `RUST_LOG`: log filter (default `info`)

use log::info;
use scriblepad_collab::{RelayServer, ServerConfig};
use std::path::PathBuf;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("SCRIBLEPAD_BIND") {
        config.bind_addr = bind;
    }
    config.storage_path = std::env::var_os("SCRIBLEPAD_DATA").map(PathBuf::from);
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    match &config.storage_path {
        Some(path) => info!("Starting relay with storage at {}", path.display()),
        None => info!("Starting relay without persistence"),
    }

    let server = RelayServer::new(config)?;
    server.run().await
}
