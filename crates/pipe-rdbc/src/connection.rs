//! Connection traits for pipe-rdbc
//!
//! Core abstractions for reading from a relational source:
//! - Connection: liveness probe, small queries and cursor creation
//! - Cursor: a forward-only server-side result cursor fetched in batches
//! - ConnectionFactory: creates physical connections from [`ConnectionParams`]

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::types::{ColumnMetadata, Row};

/// Fetch size used when the caller does not give one
pub const DEFAULT_FETCH_SIZE: u32 = 256;

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that returns rows, materializing them.
    ///
    /// Meant for small diagnostic queries; exports go through [`Connection::open_cursor`].
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        let rows = self.query(sql).await?;
        Ok(rows.into_iter().next())
    }

    /// Describe the result columns of a query without executing it
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMetadata>>;

    /// Open a read-only, forward-only cursor over the result of `sql`.
    ///
    /// The connection is dedicated to the cursor until it is closed.
    async fn open_cursor(&self, sql: &str, options: &CursorOptions) -> Result<Box<dyn Cursor>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A server-side cursor over a query result.
///
/// Rows are pulled one at a time; implementations keep at most one fetch
/// batch in memory.
#[async_trait]
pub trait Cursor: Send {
    /// Column layout of the result, fixed for the lifetime of the cursor
    fn columns(&self) -> &[ColumnMetadata];

    /// Advance to the next row
    async fn next(&mut self) -> Result<Option<Row>>;

    /// Absolute row number of the current row (1-based, 0 before the first row)
    fn row_number(&self) -> u64;

    /// Position the cursor on absolute row `row`, so the following call to
    /// [`Cursor::next`] returns row `row + 1`.
    ///
    /// Returns `Ok(false)` when the result has fewer than `row` rows.
    /// Backends without random positioning return an `Unsupported` error and
    /// leave the cursor where it was.
    async fn absolute(&mut self, row: u64) -> Result<bool>;

    /// Drain warnings the source reported since the last call
    fn take_warnings(&mut self) -> Vec<SourceWarning>;

    /// Close the cursor and end its read-only scope on the connection
    async fn close(&mut self) -> Result<()>;
}

/// Options applied when opening a cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Rows fetched per round trip (`None` uses the backend default)
    pub fetch_size: Option<u32>,
    /// Cap on the absolute row number the cursor will return
    pub max_rows: Option<u64>,
    /// Statement timeout
    pub query_timeout: Option<Duration>,
}

impl CursorOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set fetch size
    pub fn with_fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    /// Set the max rows cap
    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Set statement timeout
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Effective fetch size; zero is treated as unset
    pub fn effective_fetch_size(&self) -> u32 {
        match self.fetch_size {
            Some(0) | None => DEFAULT_FETCH_SIZE,
            Some(n) => n,
        }
    }
}

/// A warning reported by the source while executing a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWarning {
    /// SQLSTATE code
    pub code: String,
    /// Severity as reported by the source
    pub severity: String,
    /// Human-readable message
    pub message: String,
}

impl SourceWarning {
    /// Create a new warning
    pub fn new(
        code: impl Into<String>,
        severity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            severity: severity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SQL state '{}', severity '{}', message [{}]",
            self.code, self.severity, self.message
        )
    }
}

/// Parameters needed to open physical connections to one source
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Source URL (e.g. `jdbc:postgresql://host:5432/db`)
    pub url: String,
    /// User name; overrides one embedded in the URL
    pub user: Option<String>,
    /// Password; overrides one embedded in the URL
    pub password: Option<String>,
    /// Application name reported to the source
    pub application_name: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redact credentials from the URL to prevent leaking passwords to logs.
        let redacted_url = match url::Url::parse(self.url.trim_start_matches("jdbc:")) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                let mut redacted = parsed.to_string();
                for (key, _) in parsed.query_pairs() {
                    if key.eq_ignore_ascii_case("password") {
                        redacted = format!(
                            "{}?***",
                            redacted.split('?').next().unwrap_or_default()
                        );
                        break;
                    }
                }
                redacted
            }
            Err(_) => "***".to_string(),
        };

        f.debug_struct("ConnectionParams")
            .field("url", &redacted_url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ConnectionParams {
    /// Create parameters with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            application_name: Some("pipe".into()),
        }
    }

    /// Build parameters from a request parameter map (`url`, `user`, `password`)
    pub fn from_map(params: &HashMap<String, String>) -> Option<Self> {
        let url = params.get("url")?;
        let mut this = Self::new(url.clone());
        this.user = params.get("user").cloned();
        this.password = params.get("password").cloned();
        Some(this)
    }

    /// Set user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>>;

    /// Get the database type
    fn database_type(&self) -> DatabaseType;

    /// Whether this factory can connect to `url`
    fn supports(&self, url: &str) -> bool;
}

/// Database type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// PostgreSQL wire protocol (PostgreSQL, CockroachDB)
    PostgreSQL,
    /// In-process test source
    Memory,
}

impl DatabaseType {
    /// Port assumed when a URL does not name one
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::Memory => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostgreSQL => write!(f, "PostgreSQL"),
            Self::Memory => write!(f, "Memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_options_builder() {
        let options = CursorOptions::new()
            .with_fetch_size(500)
            .with_max_rows(10)
            .with_query_timeout(Duration::from_secs(5));

        assert_eq!(options.fetch_size, Some(500));
        assert_eq!(options.max_rows, Some(10));
        assert_eq!(options.query_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_effective_fetch_size() {
        assert_eq!(CursorOptions::new().effective_fetch_size(), DEFAULT_FETCH_SIZE);
        assert_eq!(
            CursorOptions::new()
                .with_fetch_size(0)
                .effective_fetch_size(),
            DEFAULT_FETCH_SIZE
        );
        assert_eq!(
            CursorOptions::new()
                .with_fetch_size(16)
                .effective_fetch_size(),
            16
        );
    }

    #[test]
    fn test_params_debug_redacts_password() {
        let params = ConnectionParams::new("jdbc:postgresql://root:secret@db:26257/app")
            .with_user("root")
            .with_password("hunter2");

        let debug = format!("{:?}", params);
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("db:26257"));
    }

    #[test]
    fn test_params_from_map() {
        let mut map = HashMap::new();
        assert!(ConnectionParams::from_map(&map).is_none());

        map.insert("url".to_string(), "jdbc:postgresql://localhost/db".to_string());
        map.insert("user".to_string(), "app".to_string());
        let params = ConnectionParams::from_map(&map).unwrap();
        assert_eq!(params.user.as_deref(), Some("app"));
        assert!(params.password.is_none());
    }

    #[test]
    fn test_database_type_display() {
        assert_eq!(format!("{}", DatabaseType::PostgreSQL), "PostgreSQL");
        assert_eq!(DatabaseType::PostgreSQL.default_port(), Some(5432));
        assert_eq!(DatabaseType::Memory.default_port(), None);
    }
}
