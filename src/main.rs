//! babble-server: a multi-client babble server
//!
//! Features:
//! - LOGIN / PUBLISH / FOLLOW / TIMELINE / FOLLOW_COUNT / RDV commands
//! - One thread per connection, fixed executor pool behind a bounded queue
//! - Configuration via CLI arguments or TOML file

use babble_server::config::Config;
use babble_server::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        host = %config.host,
        port = config.port,
        workers = config.workers,
        max_connections = config.max_connections,
        queue_capacity = config.queue_capacity,
        max_clients = config.max_clients,
        "Starting babble server"
    );

    let server = Server::new(config);
    server.run()?;
    Ok(())
}
