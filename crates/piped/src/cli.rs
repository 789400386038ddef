//! Command line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::PipedConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "piped")]
#[command(version, about = "Streams query results and resources as delimited text over HTTP")]
pub struct Cli {
    /// Path to configuration file; defaults apply when omitted
    #[arg(short, long, env = "PIPED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address, overrides server.host
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port, overrides server.port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Load and validate the configuration, then exit
    Validate,
}

impl Cli {
    /// Load the configuration file and apply command line overrides
    pub fn load_config(&self) -> anyhow::Result<PipedConfig> {
        let mut config = match &self.config {
            Some(path) => PipedConfig::from_file(path)?,
            None => PipedConfig::default(),
        };
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}
