//! nsrpc: standalone netstring JSON-RPC server
//!
//! Serves the built-in `core.*` methods and the server's own `jsonrpc`
//! module. Configuration via CLI arguments or TOML file.

use nsrpc::rpc::module::FACTORY_NAME;
use nsrpc::rpc::{Plugins, QueueHub};
use nsrpc::{logging, Config, Server};
use std::sync::Arc;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let log_level = logging::init(&config.log_level)?;

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        max_connections = config.max_connections,
        close_flags = config.close_flags.bits(),
        "Starting nsrpc server"
    );

    let plugins = Arc::new(Plugins::new());
    let server = Server::builder(config)
        .plugins(plugins.clone())
        .sink(Arc::new(QueueHub::new()))
        .log_level(log_level)
        .start()?;
    plugins.register(FACTORY_NAME, Arc::new(server.rpc_module()));

    server.wait()?;
    Ok(())
}
