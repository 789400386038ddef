//! Error types for pipe-rdbc
//!
//! Errors are grouped into categories so callers can decide how to surface
//! them without matching on every variant:
//! - Source access (connection, query, timeout, pool exhaustion, warnings)
//! - Sink failures (the row consumer stopped accepting rows)
//! - Consistency failures (cursor position diverged from the row counter)

use std::fmt;
use thiserror::Error;

/// Result type for pipe-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors
    Connection,
    /// Query execution errors
    Query,
    /// Type conversion errors
    TypeConversion,
    /// Timeout errors
    Timeout,
    /// Configuration error
    Configuration,
    /// Pool exhausted
    PoolExhausted,
    /// Source warning raised in strict mode
    Warning,
    /// Row consumer failed to accept a row
    Sink,
    /// Cursor position diverged from the delivered row count
    Consistency,
    /// Unsupported/other errors
    Other,
}

impl ErrorCategory {
    /// Whether the failure originates in the source system
    #[inline]
    pub const fn is_source_access(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Query
                | Self::TypeConversion
                | Self::Timeout
                | Self::Configuration
                | Self::PoolExhausted
                | Self::Warning
        )
    }
}

/// Main error type for pipe-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}{}", sql_suffix(.sql))]
    Connection {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}{}", sql_suffix(.sql))]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}{}", sql_suffix(.sql))]
    TypeConversion { message: String, sql: Option<String> },

    /// Operation timed out
    #[error("timeout: {message}{}", sql_suffix(.sql))]
    Timeout { message: String, sql: Option<String> },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Source reported a warning and warnings are not ignored
    #[error("warning not ignored: {warning}{}", sql_suffix(.sql))]
    Warning {
        warning: crate::connection::SourceWarning,
        sql: Option<String>,
    },

    /// Row consumer rejected a row
    #[error("sink failure: {source}")]
    Sink {
        #[source]
        source: std::io::Error,
    },

    /// Cursor reported a row number other than the one expected
    #[error("unexpected cursor position: expected row {expected}, cursor at {actual}")]
    Consistency { expected: u64, actual: u64 },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

fn sql_suffix(sql: &Option<String>) -> String {
    match sql {
        Some(sql) => format!(" [{}]", sql),
        None => String::new(),
    }
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Warning { .. } => ErrorCategory::Warning,
            Self::Sink { .. } => ErrorCategory::Sink,
            Self::Consistency { .. } => ErrorCategory::Consistency,
            Self::Unsupported { .. } => ErrorCategory::Other,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            sql: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
            sql: None,
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a sink failure
    pub fn sink(source: std::io::Error) -> Self {
        Self::Sink { source }
    }

    /// Attach the offending query text to a source error that lacks it.
    ///
    /// Errors that already name a query keep it; sink and consistency
    /// failures are returned unchanged.
    pub fn with_sql(mut self, query: &str) -> Self {
        if let Some(slot) = self.sql_slot() {
            if slot.is_none() {
                *slot = Some(query.to_string());
            }
        }
        self
    }

    /// The query text attached to this error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Connection { sql, .. }
            | Self::Query { sql, .. }
            | Self::TypeConversion { sql, .. }
            | Self::Timeout { sql, .. }
            | Self::Warning { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    fn sql_slot(&mut self) -> Option<&mut Option<String>> {
        match self {
            Self::Connection { sql, .. }
            | Self::Query { sql, .. }
            | Self::TypeConversion { sql, .. }
            | Self::Timeout { sql, .. }
            | Self::Warning { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Warning => write!(f, "warning"),
            Self::Sink => write!(f, "sink"),
            Self::Consistency => write!(f, "consistency"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_access_categories() {
        assert!(ErrorCategory::Connection.is_source_access());
        assert!(ErrorCategory::Query.is_source_access());
        assert!(ErrorCategory::Warning.is_source_access());
        assert!(ErrorCategory::PoolExhausted.is_source_access());

        assert!(!ErrorCategory::Sink.is_source_access());
        assert!(!ErrorCategory::Consistency.is_source_access());
    }

    #[test]
    fn test_with_sql_attaches_once() {
        let err = Error::query("relation does not exist").with_sql("select * from nope");
        assert_eq!(err.sql(), Some("select * from nope"));

        let err = err.with_sql("select 2");
        assert_eq!(err.sql(), Some("select * from nope"));
    }

    #[test]
    fn test_with_sql_leaves_sink_alone() {
        let err = Error::sink(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .with_sql("select 1");
        assert_eq!(err.category(), ErrorCategory::Sink);
        assert!(err.sql().is_none());
    }

    #[test]
    fn test_with_sql_reaches_every_source_error() {
        let query = "select n from big";
        for err in [
            Error::type_conversion("column 1 (numeric): out of range"),
            Error::timeout("fetching rows: statement cancelled"),
            Error::connection("connection reset by peer"),
        ] {
            let err = err.with_sql(query);
            assert_eq!(err.sql(), Some(query));
            assert!(err.to_string().ends_with("[select n from big]"));
        }

        let err = Error::config("bad url").with_sql(query);
        assert!(err.sql().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("no route to db-2:5432");
        assert!(err.to_string().contains("db-2:5432"));

        let err = Error::query_with_sql("column \"nme\" does not exist", "select nme from staff");
        assert!(err.to_string().contains("does not exist"));
        assert!(err.to_string().contains("select nme from staff"));

        let err = Error::Consistency {
            expected: 3,
            actual: 4,
        };
        assert!(err.to_string().contains("expected row 3"));
    }
}
