//! Parley Gateway - Main entry point.

use anyhow::Result;
use parley_common::config::Config;
use parley_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("Parley Gateway v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;

    // Start the gateway server
    parley_gateway::start_server(&config).await
}
