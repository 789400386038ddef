//! piped - streaming export service
//!
//! Usage:
//!   # Defaults: 0.0.0.0:8080, ./resources as the classpath bundle
//!   piped
//!
//!   # With a configuration file and a port override
//!   piped --config piped.yaml --port 9090
//!
//!   # Check a configuration file
//!   piped --config piped.yaml validate

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipe_export::Exporter;
use pipe_rdbc::registry::SourceRegistry;
use piped::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.load_config()?;

    if cli.command == Some(Command::Validate) {
        println!("Configuration is valid");
        return Ok(());
    }

    tracing::info!(
        "Starting {} v{} (pool max_size={}, min_idle={}, bundle_dir={})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.pool.max_size,
        config.pool.min_idle,
        config.resources.bundle_dir.display()
    );

    let registry = Arc::new(SourceRegistry::postgres(config.pool_settings()));
    let exporter = Arc::new(Exporter::new(registry, config.export_settings()));

    piped::serve(&config, exporter).await
}
