//! In-process source for tests
//!
//! `MemoryDatabase` holds tables in memory and understands the handful of
//! statements the export path issues:
//! - `select 1` (liveness probe)
//! - `select version()`
//! - `select * from <table>`
//!
//! Behaviour switches (random positioning, injected warnings at open or on a
//! given row, failures after N rows, an unavailable source) and counters let
//! tests observe exactly what the cursor reader and the registry did against
//! the source.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    Connection, ConnectionFactory, ConnectionParams, Cursor, CursorOptions, DatabaseType,
    SourceWarning,
};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Columns, Row, Value};

/// Version string reported by `select version()`
pub const MEMORY_VERSION: &str = "MemoryDB 1.0 (pipe-rdbc testing)";

#[derive(Clone)]
struct MemoryTable {
    columns: Columns,
    rows: Arc<[Vec<Value>]>,
}

#[derive(Debug, Clone)]
struct Behavior {
    supports_absolute: bool,
    warnings: Vec<SourceWarning>,
    row_warnings: Vec<(u64, SourceWarning)>,
    fail_after: Option<u64>,
    misreport_row: Option<u64>,
    version_fails: bool,
    connect_delay: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            supports_absolute: true,
            warnings: Vec::new(),
            row_warnings: Vec::new(),
            fail_after: None,
            misreport_row: None,
            version_fails: false,
            connect_delay: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connections_closed: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_closed: AtomicU64,
    fetches: AtomicU64,
    rows_fetched: AtomicU64,
    absolute_calls: AtomicU64,
    statements: Mutex<Vec<String>>,
}

/// Snapshot of what the source observed
#[derive(Debug, Clone, Default)]
pub struct MemoryCounters {
    /// Physical connections opened
    pub connects: u64,
    /// Physical connections closed
    pub connections_closed: u64,
    /// Cursors opened
    pub cursors_opened: u64,
    /// Cursors closed
    pub cursors_closed: u64,
    /// Fetch round trips
    pub fetches: u64,
    /// Rows shipped to the client across all fetches
    pub rows_fetched: u64,
    /// Random positioning requests
    pub absolute_calls: u64,
    /// Every statement received, in order
    pub statements: Vec<String>,
}

impl MemoryCounters {
    /// Number of times `sql` was received
    pub fn statements_for(&self, sql: &str) -> usize {
        self.statements
            .iter()
            .filter(|s| s.eq_ignore_ascii_case(sql))
            .count()
    }
}

struct Inner {
    tables: RwLock<HashMap<String, MemoryTable>>,
    behavior: RwLock<Behavior>,
    counters: Counters,
    unavailable: AtomicBool,
}

/// Shared in-memory database; clones observe the same state
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(HashMap::new()),
                behavior: RwLock::new(Behavior::default()),
                counters: Counters::default(),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Add a table with `(name, type)` columns
    pub fn with_table(self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<Value>>) -> Self {
        self.add_table(name, columns, rows);
        self
    }

    /// Add or replace a table
    pub fn add_table(&self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<Value>>) {
        let columns: Columns = columns
            .iter()
            .enumerate()
            .map(|(i, (n, t))| ColumnMetadata::new(*n, *t).with_ordinal(i as u32 + 1))
            .collect();
        self.inner.tables.write().insert(
            name.to_ascii_lowercase(),
            MemoryTable {
                columns,
                rows: rows.into(),
            },
        );
    }

    /// Toggle support for absolute cursor positioning
    pub fn set_supports_absolute(&self, supported: bool) {
        self.inner.behavior.write().supports_absolute = supported;
    }

    /// Report `warning` on every cursor opened from now on
    pub fn add_warning(&self, warning: SourceWarning) {
        self.inner.behavior.write().warnings.push(warning);
    }

    /// Report `warning` from the fetch that ships absolute row `row`
    pub fn add_warning_at_row(&self, row: u64, warning: SourceWarning) {
        self.inner.behavior.write().row_warnings.push((row, warning));
    }

    /// Fail fetching any row past absolute row `row`
    pub fn set_fail_after(&self, row: Option<u64>) {
        self.inner.behavior.write().fail_after = row;
    }

    /// Report a wrong row number once the cursor reaches absolute row `row`
    pub fn set_misreport_row(&self, row: Option<u64>) {
        self.inner.behavior.write().misreport_row = row;
    }

    /// Make `select version()` fail
    pub fn set_version_fails(&self, fails: bool) {
        self.inner.behavior.write().version_fails = fails;
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.behavior.write().connect_delay = delay;
    }

    /// Refuse new connections
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot the counters
    pub fn counters(&self) -> MemoryCounters {
        let c = &self.inner.counters;
        MemoryCounters {
            connects: c.connects.load(Ordering::SeqCst),
            connections_closed: c.connections_closed.load(Ordering::SeqCst),
            cursors_opened: c.cursors_opened.load(Ordering::SeqCst),
            cursors_closed: c.cursors_closed.load(Ordering::SeqCst),
            fetches: c.fetches.load(Ordering::SeqCst),
            rows_fetched: c.rows_fetched.load(Ordering::SeqCst),
            absolute_calls: c.absolute_calls.load(Ordering::SeqCst),
            statements: c.statements.lock().clone(),
        }
    }

    fn record_statement(&self, sql: &str) {
        self.inner.counters.statements.lock().push(sql.trim().to_string());
    }

    fn resolve(&self, sql: &str) -> Result<MemoryTable> {
        let normalized = sql.trim().trim_end_matches(';').trim().to_ascii_lowercase();

        if normalized == "select 1" {
            return Ok(MemoryTable {
                columns: single_column("?column?", "int4"),
                rows: vec![vec![Value::Int32(1)]].into(),
            });
        }

        if normalized == "select version()" {
            if self.inner.behavior.read().version_fails {
                return Err(Error::query("function version() does not exist"));
            }
            return Ok(MemoryTable {
                columns: single_column("version", "text"),
                rows: vec![vec![Value::String(MEMORY_VERSION.to_string())]].into(),
            });
        }

        if let Some(table) = normalized.strip_prefix("select * from ") {
            let table = table.trim();
            return self
                .inner
                .tables
                .read()
                .get(table)
                .cloned()
                .ok_or_else(|| Error::query(format!("relation \"{}\" does not exist", table)));
        }

        Err(Error::query(format!("syntax error at or near \"{}\"", sql.trim())))
    }
}

fn single_column(name: &str, type_name: &str) -> Columns {
    vec![ColumnMetadata::new(name, type_name).with_ordinal(1)].into()
}

/// Connection factory backed by a [`MemoryDatabase`]; accepts `memory:` URLs
#[derive(Clone)]
pub struct MemoryConnectionFactory {
    db: MemoryDatabase,
}

impl MemoryConnectionFactory {
    /// Create a factory for `db`
    pub fn new(db: MemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, _params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        let delay = self.db.inner.behavior.read().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.db.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::connection("connection refused"));
        }
        self.db.inner.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Memory
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with("memory:") || url.starts_with("jdbc:memory:")
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.db.record_statement(sql);
        let table = self.db.resolve(sql)?;
        Ok(table
            .rows
            .iter()
            .map(|values| Row::new(table.columns.clone(), values.clone()))
            .collect())
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMetadata>> {
        self.ensure_open()?;
        let table = self.db.resolve(sql)?;
        Ok(table.columns.to_vec())
    }

    async fn open_cursor(&self, sql: &str, options: &CursorOptions) -> Result<Box<dyn Cursor>> {
        self.ensure_open()?;
        self.db.record_statement(sql);
        let table = self.db.resolve(sql)?;
        let behavior = self.db.inner.behavior.read().clone();
        self.db
            .inner
            .counters
            .cursors_opened
            .fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryCursor {
            db: self.db.clone(),
            table,
            fetch_size: options.effective_fetch_size() as u64,
            max_rows: options.max_rows,
            behavior: behavior.clone(),
            warnings: behavior.warnings,
            buffer: VecDeque::new(),
            fetched_through: 0,
            position: 0,
            closed: false,
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.db.inner.unavailable.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.db
                .inner
                .counters
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryCursor {
    db: MemoryDatabase,
    table: MemoryTable,
    fetch_size: u64,
    max_rows: Option<u64>,
    behavior: Behavior,
    warnings: Vec<SourceWarning>,
    buffer: VecDeque<Row>,
    /// Absolute number of the last row shipped into `buffer`
    fetched_through: u64,
    position: u64,
    closed: bool,
}

impl MemoryCursor {
    fn limit(&self) -> u64 {
        let len = self.table.rows.len() as u64;
        match self.max_rows {
            Some(max) if max > 0 => len.min(max),
            _ => len,
        }
    }

    fn fetch(&mut self) {
        let start = self.fetched_through;
        let end = (start + self.fetch_size).min(self.limit());
        let counters = &self.db.inner.counters;
        counters.fetches.fetch_add(1, Ordering::SeqCst);
        counters.rows_fetched.fetch_add(end - start, Ordering::SeqCst);
        for idx in start..end {
            self.buffer.push_back(Row::new(
                self.table.columns.clone(),
                self.table.rows[idx as usize].clone(),
            ));
        }
        let shipped = start + 1..=end;
        self.warnings.extend(
            self.behavior
                .row_warnings
                .iter()
                .filter(|(row, _)| shipped.contains(row))
                .map(|(_, warning)| warning.clone()),
        );
        self.fetched_through = end;
    }
}

#[async_trait]
impl Cursor for MemoryCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.table.columns
    }

    async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(Error::query("cursor is closed"));
        }
        if self.position >= self.limit() {
            return Ok(None);
        }
        if let Some(fail_after) = self.behavior.fail_after {
            if self.position >= fail_after {
                return Err(Error::query("injected failure while fetching"));
            }
        }
        if self.buffer.is_empty() {
            self.fetch();
        }
        match self.buffer.pop_front() {
            Some(row) => {
                self.position += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn row_number(&self) -> u64 {
        match self.behavior.misreport_row {
            Some(row) if self.position == row => self.position + 1,
            _ => self.position,
        }
    }

    async fn absolute(&mut self, row: u64) -> Result<bool> {
        self.db
            .inner
            .counters
            .absolute_calls
            .fetch_add(1, Ordering::SeqCst);
        if !self.behavior.supports_absolute {
            return Err(Error::unsupported("cursor does not support absolute positioning"));
        }
        let limit = self.limit();
        self.buffer.clear();
        self.position = row.min(limit);
        self.fetched_through = self.position;
        Ok(row <= limit)
    }

    fn take_warnings(&mut self) -> Vec<SourceWarning> {
        std::mem::take(&mut self.warnings)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.buffer.clear();
            self.db
                .inner
                .counters
                .cursors_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
