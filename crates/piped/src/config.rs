//! Service configuration
//!
//! Loaded from YAML with `${VAR}` and `${VAR:-default}` expansion. Every
//! section is optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use pipe_export::ExportSettings;
use pipe_rdbc::registry::PoolSettings;

static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipedConfig {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-source connection pools
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cursor reader policy
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Byte resources
    #[serde(default)]
    pub resources: ResourcesConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Response chunks buffered between an export and its client
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_stream_buffer() -> usize {
    16
}

/// Pool sizing, applied to every source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum connections per source
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle connections kept per source
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Wait limit for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Liveness probe run once per new connection
    #[serde(default = "default_init_sql")]
    pub init_sql: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_idle: default_min_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            init_sql: default_init_sql(),
        }
    }
}

fn default_max_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_init_sql() -> Option<String> {
    Some("select 1".to_string())
}

/// Cursor reader policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaderConfig {
    /// Log source warnings instead of failing
    #[serde(default = "default_true")]
    pub ignore_warnings: bool,

    /// Statement timeout
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            ignore_warnings: true,
            query_timeout_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Byte resource configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    /// Root of `classpath:` resources
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            bundle_dir: default_bundle_dir(),
        }
    }
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("./resources")
}

impl PipedConfig {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        Self::parse(&content)
    }

    /// Parse configuration text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        // An empty document means all defaults
        let config: Self = if expanded.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&expanded)
                .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_size == 0 {
            anyhow::bail!("pool.max_size must be at least 1");
        }
        if self.pool.min_idle > self.pool.max_size {
            anyhow::bail!(
                "pool.min_idle ({}) must not exceed pool.max_size ({})",
                self.pool.min_idle,
                self.pool.max_size
            );
        }
        if self.server.stream_buffer == 0 {
            anyhow::bail!("server.stream_buffer must be at least 1");
        }
        Ok(())
    }

    /// Pool settings for the source registry
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings::default()
            .with_max_size(self.pool.max_size)
            .with_min_idle(self.pool.min_idle)
            .with_acquire_timeout(Duration::from_millis(self.pool.acquire_timeout_ms))
            .with_init_sql(self.pool.init_sql.clone())
    }

    /// Export policy for the orchestrator
    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            ignore_warnings: self.reader.ignore_warnings,
            query_timeout: self.reader.query_timeout_ms.map(Duration::from_millis),
            bundle_dir: self.resources.bundle_dir.clone(),
        }
    }
}
