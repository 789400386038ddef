//! Source registry
//!
//! Caches one connection pool per [`SourceIdentity`]. Pools are created
//! lazily on first use and live as long as the registry. Concurrent first
//! requests for the same identity wait on a single creation; a failed
//! creation is not cached, so the next request tries again.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::connection::{ConnectionFactory, ConnectionParams, DatabaseType};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats, SimpleConnectionPool, DEFAULT_INIT_SQL};

/// Scheme marker for queryable sources
pub const QUERYABLE_PREFIX: &str = "jdbc:";

/// Canonical cache key for a source.
///
/// For `jdbc:<protocol>://<host>[:<port>]/...` the identity is
/// `<protocol>:<host>:<port>`, with the host lower-cased and the protocol's
/// default port filled in. Database, user and options are not part of it.
/// Any other identifier is used literally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceIdentity(String);

impl SourceIdentity {
    /// Derive the identity of a source URL
    pub fn from_url(url: &str) -> Self {
        let Some(rest) = url.strip_prefix(QUERYABLE_PREFIX) else {
            return Self(url.to_string());
        };

        match url::Url::parse(rest) {
            Ok(parsed) if parsed.host_str().is_some() => {
                let scheme = parsed.scheme();
                let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
                match parsed.port().or_else(|| default_port(scheme)) {
                    Some(port) => Self(format!("{}:{}:{}", scheme, host, port)),
                    None => Self(format!("{}:{}", scheme, host)),
                }
            }
            _ => Self(url.to_string()),
        }
    }

    /// The identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "postgresql" | "postgres" => DatabaseType::PostgreSQL.default_port(),
        _ => None,
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide pool settings applied to every pool the registry creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum pool size
    pub max_size: usize,
    /// Minimum idle count
    pub min_idle: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Liveness probe run once per new physical connection
    pub init_sql: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 1,
            acquire_timeout: Duration::from_secs(30),
            init_sql: Some(DEFAULT_INIT_SQL.to_string()),
        }
    }
}

impl PoolSettings {
    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set minimum idle count
    pub fn with_min_idle(mut self, size: usize) -> Self {
        self.min_idle = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the liveness probe
    pub fn with_init_sql(mut self, sql: Option<String>) -> Self {
        self.init_sql = sql;
        self
    }

    fn pool_config(&self, params: &ConnectionParams) -> PoolConfig {
        PoolConfig::new(params.clone())
            .with_max_size(self.max_size)
            .with_min_idle(self.min_idle)
            .with_acquire_timeout(self.acquire_timeout)
            .with_init_sql(self.init_sql.clone())
    }
}

/// A registered source as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    /// Source identity
    pub identity: String,
    /// Backend
    pub database_type: String,
    /// Open connections
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Pool counters
    pub stats: PoolStats,
}

struct Entry {
    database_type: DatabaseType,
    pool: Arc<SimpleConnectionPool>,
}

/// Registry of pooled sources keyed by [`SourceIdentity`]
pub struct SourceRegistry {
    factories: Vec<Arc<dyn ConnectionFactory>>,
    settings: PoolSettings,
    pools: DashMap<SourceIdentity, Arc<OnceCell<Entry>>>,
}

impl SourceRegistry {
    /// Create a registry without any connection factory
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            factories: Vec::new(),
            settings,
            pools: DashMap::new(),
        }
    }

    /// Create a registry that connects to PostgreSQL-protocol sources
    #[cfg(feature = "postgres")]
    pub fn postgres(settings: PoolSettings) -> Self {
        Self::new(settings).with_factory(Arc::new(crate::postgres::PgConnectionFactory))
    }

    /// Register a connection factory; earlier factories win
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Pool settings
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Return the pool for `identity`, creating it from `params` on first use.
    ///
    /// Once a pool exists, `params` are ignored for that identity.
    pub async fn acquire(
        &self,
        identity: &SourceIdentity,
        params: &ConnectionParams,
    ) -> Result<Arc<SimpleConnectionPool>> {
        let cell = match self.pools.get(identity) {
            Some(cell) => Arc::clone(cell.value()),
            None => Arc::clone(self.pools.entry(identity.clone()).or_default().value()),
        };

        let entry = cell
            .get_or_try_init(|| self.create_pool(identity, params))
            .await?;
        Ok(Arc::clone(&entry.pool))
    }

    async fn create_pool(
        &self,
        identity: &SourceIdentity,
        params: &ConnectionParams,
    ) -> Result<Entry> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.supports(&params.url))
            .ok_or_else(|| {
                Error::config(format!("no connection factory for source [{}]", identity))
            })?;

        let pool =
            SimpleConnectionPool::new(self.settings.pool_config(params), Arc::clone(factory))
                .await?;

        info!(
            "Created {} pool for source [{}] (max size {}, min idle {})",
            factory.database_type(),
            identity,
            self.settings.max_size,
            self.settings.min_idle
        );

        Ok(Entry {
            database_type: factory.database_type(),
            pool,
        })
    }

    /// Version string of the source behind `pool`, for diagnostics.
    ///
    /// Failures are logged and reported as `None`.
    pub async fn database_version(&self, pool: &SimpleConnectionPool) -> Option<String> {
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Could not obtain connection for version query: {}", e);
                return None;
            }
        };

        let version = match conn.query_one("select version()").await {
            Ok(row) => row
                .and_then(|r| r.get(0).cloned())
                .map(|v| v.to_string()),
            Err(e) => {
                warn!("Could not query database version: {}", e);
                None
            }
        };
        conn.release().await;
        version
    }

    /// Number of pools created so far
    pub fn len(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Whether no pool has been created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries of every created pool, ordered by identity
    pub fn sources(&self) -> Vec<SourceSummary> {
        let mut sources: Vec<_> = self
            .pools
            .iter()
            .filter_map(|entry| {
                entry.value().get().map(|source| SourceSummary {
                    identity: entry.key().to_string(),
                    database_type: source.database_type.to_string(),
                    size: source.pool.size(),
                    idle: source.pool.idle(),
                    stats: source.pool.stats(),
                })
            })
            .collect();
        sources.sort_by(|a, b| a.identity.cmp(&b.identity));
        sources
    }

    /// Close every pool
    pub async fn close(&self) {
        let pools: Vec<_> = self
            .pools
            .iter()
            .filter_map(|entry| entry.value().get().map(|e| Arc::clone(&e.pool)))
            .collect();
        for pool in pools {
            let _ = pool.close().await;
        }
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("factories", &self.factories.len())
            .field("settings", &self.settings)
            .field("pools", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_jdbc_url() {
        let id = SourceIdentity::from_url("jdbc:postgresql://DB.example.com:26257/bank?sslmode=disable");
        assert_eq!(id.as_str(), "postgresql:db.example.com:26257");
    }

    #[test]
    fn test_identity_ignores_database_and_user() {
        let a = SourceIdentity::from_url("jdbc:postgresql://root@localhost:26257/a");
        let b = SourceIdentity::from_url("jdbc:postgresql://admin@localhost:26257/b?user=x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_default_port() {
        let id = SourceIdentity::from_url("jdbc:postgresql://localhost/db");
        assert_eq!(id.as_str(), "postgresql:localhost:5432");
        assert_eq!(
            id,
            SourceIdentity::from_url("jdbc:postgresql://localhost:5432/other")
        );
    }

    #[test]
    fn test_identity_literal_for_other_urls() {
        let id = SourceIdentity::from_url("memory://numbers");
        assert_eq!(id.as_str(), "memory://numbers");

        let id = SourceIdentity::from_url("jdbc:not a url");
        assert_eq!(id.as_str(), "jdbc:not a url");
    }

    #[test]
    fn test_pool_settings_builder() {
        let settings = PoolSettings::default()
            .with_max_size(4)
            .with_min_idle(2)
            .with_init_sql(None);
        let config = settings.pool_config(&ConnectionParams::new("memory://x"));
        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_idle, 2);
        assert!(config.init_sql.is_none());
    }
}
