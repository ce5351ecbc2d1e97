//! Skein Server
//!
//! Runs the coordination kernel behind its HTTP API.

use std::path::PathBuf;

use skein_server::{start_server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let port = match std::env::var("PORT") {
        Ok(raw) => raw.parse()?,
        Err(_) => 3000,
    };
    let config_path = std::env::var("SKEIN_CONFIG").ok().map(PathBuf::from);

    start_server(ServerConfig { port, config_path }).await
}
