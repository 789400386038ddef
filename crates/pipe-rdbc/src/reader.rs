//! Cursor reader
//!
//! Streams the result of one query from a pooled source into a
//! [`RowConsumer`], one row at a time:
//!
//! 1. A bounded read whose offset is at or past `max_rows` produces no rows
//!    and opens no cursor.
//! 2. A connection is borrowed from the pool and a read-only, forward-only
//!    cursor is opened with the fetch size, row cap and timeout applied.
//! 3. Source warnings are logged, or raised when warnings are not ignored.
//!    Sources may report them while opening the cursor or during any later
//!    fetch, so they are collected again after every cursor step.
//! 4. The cursor skips to `row_offset`, by absolute positioning when the
//!    source supports it and by discarding rows otherwise.
//! 5. Every following row is handed to the consumer together with its
//!    absolute row number, which must match the cursor's own position.
//!
//! The cursor is closed and the connection returned to the pool on every
//! path before `read` returns.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::{Cursor, CursorOptions};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::types::{ColumnMetadata, Row};

/// Receives rows from a [`CursorReader`].
///
/// Returning an error stops the read: no further rows are fetched and the
/// failure is reported as a sink failure.
#[async_trait]
pub trait RowConsumer: Send {
    /// Whether the consumer needs the column layout even when no rows follow
    fn wants_columns(&self) -> bool {
        false
    }

    /// Column layout of the result, delivered once before the first row
    async fn columns(&mut self, _columns: &[ColumnMetadata]) -> io::Result<()> {
        Ok(())
    }

    /// Deliver one row with its absolute row number (1-based)
    async fn row(&mut self, row: Row, row_number: u64) -> io::Result<()>;
}

/// Read policy for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Rows fetched per round trip
    pub fetch_size: Option<u32>,
    /// Number of leading rows to skip
    pub row_offset: u64,
    /// Cap on the absolute row number; `None` is unbounded
    pub max_rows: Option<u64>,
    /// Statement timeout
    pub query_timeout: Option<Duration>,
    /// Log source warnings instead of failing on the first one
    pub ignore_warnings: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            fetch_size: None,
            row_offset: 0,
            max_rows: None,
            query_timeout: None,
            ignore_warnings: true,
        }
    }
}

impl ReadOptions {
    /// Set fetch size
    pub fn with_fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    /// Set row offset
    pub fn with_row_offset(mut self, offset: u64) -> Self {
        self.row_offset = offset;
        self
    }

    /// Set max rows
    pub fn with_max_rows(mut self, max_rows: Option<u64>) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Set statement timeout
    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Log warnings (`true`) or fail on the first one (`false`)
    pub fn with_ignore_warnings(mut self, ignore: bool) -> Self {
        self.ignore_warnings = ignore;
        self
    }

    /// Whether the read can produce no rows at all
    pub fn is_empty_window(&self) -> bool {
        matches!(self.max_rows, Some(max) if self.row_offset >= max)
    }

    fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            fetch_size: self.fetch_size,
            max_rows: self.max_rows,
            query_timeout: self.query_timeout,
        }
    }
}

/// Outcome of a completed read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Rows delivered to the consumer
    pub rows: u64,
    /// Whether a cursor was opened
    pub cursor_opened: bool,
}

/// Reads one query through a server-side cursor
pub struct CursorReader {
    pool: Arc<dyn ConnectionPool>,
    query: String,
    options: ReadOptions,
}

impl CursorReader {
    /// Create a reader for `query` against `pool`
    pub fn new(pool: Arc<dyn ConnectionPool>, query: impl Into<String>, options: ReadOptions) -> Self {
        Self {
            pool,
            query: query.into(),
            options,
        }
    }

    /// The query text
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Read the query into `consumer`.
    ///
    /// Source errors carry the query text. Consumer failures come back as
    /// [`Error::Sink`] and a row number mismatch as [`Error::Consistency`].
    pub async fn read(&self, consumer: &mut dyn RowConsumer) -> Result<ReadSummary> {
        if self.options.is_empty_window() {
            if consumer.wants_columns() {
                self.describe_into(consumer).await?;
            }
            debug!(
                "Offset {} is at or past max rows {:?}, nothing to read",
                self.options.row_offset, self.options.max_rows
            );
            return Ok(ReadSummary::default());
        }

        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| e.with_sql(&self.query))?;

        let mut cursor = match conn
            .open_cursor(&self.query, &self.options.cursor_options())
            .await
        {
            Ok(cursor) => cursor,
            Err(e) => {
                finish(conn, false).await;
                return Err(e.with_sql(&self.query));
            }
        };

        let result = self.drain(cursor.as_mut(), consumer).await;
        let closed = cursor.close().await;

        // A connection whose cursor could not be closed cleanly is not reused.
        finish(conn, closed.is_ok()).await;

        let result = match (result, closed) {
            (Ok(rows), Ok(())) => Ok(rows),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Err(close_err)) => {
                debug!("Closing cursor after failure also failed: {}", close_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };

        result
            .map(|rows| ReadSummary {
                rows,
                cursor_opened: true,
            })
            .map_err(|e| e.with_sql(&self.query))
    }

    async fn describe_into(&self, consumer: &mut dyn RowConsumer) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| e.with_sql(&self.query))?;
        let described = conn.describe(&self.query).await;
        finish(conn, described.is_ok()).await;

        let columns = described.map_err(|e| e.with_sql(&self.query))?;
        consumer.columns(&columns).await.map_err(Error::sink)
    }

    async fn drain(&self, cursor: &mut dyn Cursor, consumer: &mut dyn RowConsumer) -> Result<u64> {
        self.handle_warnings(cursor)?;

        consumer
            .columns(cursor.columns())
            .await
            .map_err(Error::sink)?;

        let mut row_number = 0;
        if self.options.row_offset > 0 {
            row_number = self.skip_to_row(cursor, self.options.row_offset).await?;
        }

        let mut delivered = 0;
        loop {
            let next = cursor.next().await?;
            self.handle_warnings(cursor)?;
            let Some(row) = next else {
                break;
            };
            row_number += 1;
            if row_number != cursor.row_number() {
                return Err(Error::Consistency {
                    expected: row_number,
                    actual: cursor.row_number(),
                });
            }
            consumer.row(row, row_number).await.map_err(Error::sink)?;
            delivered += 1;
        }

        debug!("Cursor exhausted after row {}", row_number);
        Ok(delivered)
    }

    /// Leave the cursor on absolute row `row` and return the row it is on
    async fn skip_to_row(&self, cursor: &mut dyn Cursor, row: u64) -> Result<u64> {
        match cursor.absolute(row).await {
            Ok(_) => {
                self.handle_warnings(cursor)?;
                return Ok(row);
            }
            Err(Error::Unsupported { message }) => {
                warn!(
                    "Cursor does not support absolute positioning ({}), fast forwarding instead",
                    message
                );
            }
            Err(e) => return Err(e),
        }

        let mut count = 0;
        while count < row {
            let next = cursor.next().await?;
            self.handle_warnings(cursor)?;
            if next.is_none() {
                break;
            }
            count += 1;
        }
        Ok(row)
    }

    fn handle_warnings(&self, cursor: &mut dyn Cursor) -> Result<()> {
        let warnings = cursor.take_warnings();
        if self.options.ignore_warnings {
            for warning in &warnings {
                warn!("Source warning ignored: {}", warning);
            }
            return Ok(());
        }
        match warnings.into_iter().next() {
            Some(warning) => Err(Error::Warning {
                warning,
                sql: Some(self.query.clone()),
            }),
            None => Ok(()),
        }
    }
}

async fn finish(conn: PooledConnection, reusable: bool) {
    if reusable {
        conn.release().await;
    } else {
        conn.discard().await;
    }
}

impl std::fmt::Debug for CursorReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorReader")
            .field("query", &self.query)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        assert!(!ReadOptions::default().is_empty_window());
        assert!(ReadOptions::default()
            .with_max_rows(Some(0))
            .is_empty_window());
        assert!(ReadOptions::default()
            .with_row_offset(5)
            .with_max_rows(Some(5))
            .is_empty_window());
        assert!(!ReadOptions::default()
            .with_row_offset(4)
            .with_max_rows(Some(5))
            .is_empty_window());
        assert!(!ReadOptions::default()
            .with_row_offset(1_000)
            .is_empty_window());
    }

    #[test]
    fn test_cursor_options_carry_policy() {
        let options = ReadOptions::default()
            .with_fetch_size(64)
            .with_max_rows(Some(10))
            .with_query_timeout(Some(Duration::from_secs(3)))
            .cursor_options();

        assert_eq!(options.fetch_size, Some(64));
        assert_eq!(options.max_rows, Some(10));
        assert_eq!(options.query_timeout, Some(Duration::from_secs(3)));
    }
}
