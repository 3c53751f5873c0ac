//! Hal - Main entry point.

use anyhow::{Context, Result};
use hal_channels::start_server;
use hal_common::config::Config;
use hal_common::logging::init_logging_with_exclusions;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Hal v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;

    // Start the service
    start_server(&config).await
}
