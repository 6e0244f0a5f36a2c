// src/main.rs

use crewforge::config::EngineConfig;
use crewforge::engine::Engine;
use crewforge::server;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = EngineConfig::from_env();
    let engine = Engine::from_config(config)?;

    let addr: SocketAddr = std::env::var("CREWFORGE_ADDR")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

    server::serve(engine, addr).await
}
