//! wirebench: a TCP request/response latency benchmark server.
//!
//! Speaks a fixed-header binary protocol (magic / type / length + JSON
//! payload), answers each request after a simulated processing delay, and
//! logs one timing summary row per connection to an append-only CSV file.

use tracing::info;
use tracing_subscriber::EnvFilter;
use wirebench::config::Config;
use wirebench::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        server_id = %config.server_id,
        processing_delay_ms = config.processing_delay_ms,
        metrics = %config.metrics_path().display(),
        "Starting wirebench server"
    );

    Server::new(config).run().await
}
