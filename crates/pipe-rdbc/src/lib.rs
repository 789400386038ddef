//! # pipe-rdbc
//!
//! Relational connectivity for pipe exports.
//!
//! This crate owns everything between a source URL and a stream of rows:
//!
//! - **Sources**: a [`registry::SourceRegistry`] keeps one bounded pool per
//!   source identity, created lazily and shared by every export
//! - **Connection Pooling**: fail-fast pool creation with a liveness probe
//!   on every new physical connection
//! - **Cursors**: read-only, forward-only server-side cursors with a fetch
//!   size, an absolute row cap and a statement timeout
//! - **Cursor Reader**: offset positioning, warning policy and row number
//!   consistency on top of any [`connection::Cursor`]
//! - **Values**: a [`types::Value`] per column with a canonical text form
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipe_rdbc::prelude::*;
//!
//! let registry = SourceRegistry::postgres(PoolSettings::default());
//! let url = "jdbc:postgresql://localhost:5432/bank";
//! let pool = registry
//!     .acquire(&SourceIdentity::from_url(url), &ConnectionParams::new(url))
//!     .await?;
//!
//! let reader = CursorReader::new(
//!     pool,
//!     "select * from accounts",
//!     ReadOptions::default().with_row_offset(100).with_max_rows(Some(200)),
//! );
//! let summary = reader.read(&mut consumer).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL wire protocol sources via tokio-postgres (default)
//! - `testing` - in-memory source for tests

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod pool;
pub mod reader;
pub mod registry;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and type system
    pub use crate::types::{ColumnMetadata, Columns, Row, Value};

    // Connection traits and parameters
    pub use crate::connection::{
        Connection, ConnectionFactory, ConnectionParams, Cursor, CursorOptions, DatabaseType,
        SourceWarning,
    };

    // Pool types
    pub use crate::pool::{
        ConnectionPool, PoolConfig, PoolStats, PooledConnection, SimpleConnectionPool,
    };

    // Reading
    pub use crate::reader::{CursorReader, ReadOptions, ReadSummary, RowConsumer};

    // Source registry
    pub use crate::registry::{PoolSettings, SourceIdentity, SourceRegistry, SourceSummary};

    pub use std::sync::Arc;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;
