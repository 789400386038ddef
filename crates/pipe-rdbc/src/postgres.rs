//! PostgreSQL backend implementation for pipe-rdbc
//!
//! Speaks the PostgreSQL wire protocol through tokio-postgres, which also
//! covers CockroachDB. Provides:
//! - JDBC-style URL translation (`jdbc:postgresql://host:port/db?user=..`)
//! - Connections with notice capture (surfaced as cursor warnings)
//! - Server-side cursors declared inside a read-only transaction and
//!   fetched `fetch_size` rows per round trip
//!
//! Rows travel in the text format. Integers, booleans, UUIDs and `bytea`
//! are parsed into typed values; every other type keeps the server's own
//! text, so `numeric` beyond any fixed precision, `NaN`, intervals,
//! network addresses and arrays come out exactly as PostgreSQL prints them.
//!
//! Every statement sent to the server is logged at `debug` under the
//! `pipe_rdbc::sql` target.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::Type;
use tokio_postgres::{AsyncMessage, Client, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionFactory, ConnectionParams, Cursor, CursorOptions, DatabaseType,
    SourceWarning,
};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Columns, Row, Value};

const CURSOR_NAME: &str = "pipe_cursor";
const SEEK_SAVEPOINT: &str = "pipe_seek";

/// Tracing target for statement logging
pub const SQL_TRACE: &str = "pipe_rdbc::sql";

type Notices = Arc<Mutex<Vec<SourceWarning>>>;

/// Decode one field from its text form
fn text_to_value(pg_type: &Type, text: &str) -> std::result::Result<Value, String> {
    fn parse<T: std::str::FromStr>(text: &str) -> std::result::Result<T, String>
    where
        T::Err: std::fmt::Display,
    {
        text.parse::<T>().map_err(|e| format!("invalid value {:?}: {}", text, e))
    }

    match *pg_type {
        Type::BOOL => match text {
            "t" => Ok(Value::Bool(true)),
            "f" => Ok(Value::Bool(false)),
            other => Err(format!("invalid boolean {:?}", other)),
        },
        Type::INT2 => parse(text).map(Value::Int16),
        Type::INT4 => parse(text).map(Value::Int32),
        Type::INT8 => parse(text).map(Value::Int64),
        Type::OID => parse::<u32>(text).map(|v| Value::Int64(i64::from(v))),
        Type::UUID => parse(text).map(Value::Uuid),
        // bytea_output = escape has no hex prefix; keep that text as is.
        Type::BYTEA => match text.strip_prefix("\\x") {
            Some(digits) => hex::decode(digits)
                .map(Value::Bytes)
                .map_err(|e| format!("invalid bytea: {}", e)),
            None => Ok(Value::String(text.to_string())),
        },
        _ => Ok(Value::String(text.to_string())),
    }
}

fn pg_columns(columns: &[tokio_postgres::Column]) -> Columns {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| ColumnMetadata::new(c.name(), c.type_().name()).with_ordinal(i as u32 + 1))
        .collect()
}

/// Column layout and wire types of a prepared statement
#[derive(Clone)]
struct Layout {
    columns: Columns,
    types: Arc<[Type]>,
}

impl Layout {
    fn empty() -> Self {
        Self {
            columns: Vec::<ColumnMetadata>::new().into(),
            types: Vec::<Type>::new().into(),
        }
    }

    fn of(statement: &tokio_postgres::Statement) -> Self {
        Self {
            columns: pg_columns(statement.columns()),
            types: statement.columns().iter().map(|c| c.type_().clone()).collect(),
        }
    }

    /// Convert a text-format row to a pipe Row sharing `columns`
    fn decode(&self, row: &SimpleQueryRow) -> Result<Row> {
        let fallback = Type::TEXT;
        let values = (0..row.len())
            .map(|idx| {
                let pg_type = self.types.get(idx).unwrap_or(&fallback);
                let conversion = |message: String| {
                    Error::type_conversion(format!("column {} ({}): {}", idx + 1, pg_type, message))
                };
                match row.try_get(idx) {
                    Ok(Some(text)) => text_to_value(pg_type, text).map_err(conversion),
                    Ok(None) => Ok(Value::Null),
                    Err(e) => Err(conversion(e.to_string())),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(self.columns.clone(), values))
    }
}

fn text_rows(messages: Vec<SimpleQueryMessage>) -> impl Iterator<Item = SimpleQueryRow> {
    messages.into_iter().filter_map(|message| match message {
        SimpleQueryMessage::Row(row) => Some(row),
        _ => None,
    })
}

/// Map a driver error; the caller attaches the query text.
fn pg_error(context: &str, e: tokio_postgres::Error) -> Error {
    // statement_timeout cancels the statement server side
    if e.code() == Some(&tokio_postgres::error::SqlState::QUERY_CANCELED) {
        return Error::timeout(format!("{}: statement cancelled", context));
    }
    let message = match e.as_db_error() {
        Some(db) => format!("{}: {} (SQL state {})", context, db.message(), db.code().code()),
        None => format!("{}: {}", context, e),
    };
    Error::Query {
        message,
        sql: None,
        source: Some(Box::new(e)),
    }
}

/// Translate connection parameters into a tokio-postgres configuration.
///
/// Accepts `jdbc:postgresql://`, `postgresql://` and `postgres://` URLs.
/// Explicit `user`/`password` parameters win over the URL; otherwise URL
/// userinfo and then the `user`/`password` query parameters are used.
pub fn pg_config(params: &ConnectionParams) -> Result<tokio_postgres::Config> {
    let raw = params.url.strip_prefix("jdbc:").unwrap_or(&params.url);
    let url = url::Url::parse(raw)
        .map_err(|e| Error::config(format!("invalid source url: {}", e)))?;

    if !matches!(url.scheme(), "postgresql" | "postgres") {
        return Err(Error::config(format!(
            "unsupported source protocol: {}",
            url.scheme()
        )));
    }

    let mut config = tokio_postgres::Config::new();
    config.host(url.host_str().unwrap_or("localhost"));
    config.port(
        url.port()
            .or(DatabaseType::PostgreSQL.default_port())
            .unwrap_or(5432),
    );

    let dbname = url.path().trim_start_matches('/');
    if !dbname.is_empty() {
        config.dbname(dbname);
    }

    let mut user = (!url.username().is_empty()).then(|| url.username().to_string());
    let mut password = url.password().map(str::to_string);
    let mut application_name = params.application_name.clone();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "user" => user = user.or_else(|| Some(value.to_string())),
            "password" => password = password.or_else(|| Some(value.to_string())),
            "ApplicationName" | "application_name" => application_name = Some(value.to_string()),
            "sslmode" => {
                let mode = match value.as_ref() {
                    "disable" => tokio_postgres::config::SslMode::Disable,
                    "require" | "verify-ca" | "verify-full" => {
                        tokio_postgres::config::SslMode::Require
                    }
                    _ => tokio_postgres::config::SslMode::Prefer,
                };
                config.ssl_mode(mode);
            }
            "connectTimeout" | "connect_timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    config.connect_timeout(Duration::from_secs(secs));
                }
            }
            _ => {}
        }
    }

    if let Some(user) = params.user.clone().or(user) {
        config.user(&user);
    }
    if let Some(password) = params.password.clone().or(password) {
        config.password(password);
    }
    if let Some(name) = application_name {
        config.application_name(&name);
    }

    Ok(config)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<Client>,
    closed: AtomicBool,
    notices: Notices,
}

impl PgConnection {
    fn new(client: Client, notices: Notices) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
            notices,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.ensure_open()?;

        debug!(target: SQL_TRACE, "prepare: {}", sql);
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| pg_error("preparing query", e).with_sql(sql))?;
        let layout = Layout::of(&statement);

        debug!(target: SQL_TRACE, "query: {}", sql);
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| pg_error("executing query", e).with_sql(sql))?;

        text_rows(messages)
            .map(|row| layout.decode(&row).map_err(|e| e.with_sql(sql)))
            .collect()
    }

    async fn describe(&self, sql: &str) -> Result<Vec<ColumnMetadata>> {
        self.ensure_open()?;

        debug!(target: SQL_TRACE, "describe: {}", sql);
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| pg_error("describing query", e).with_sql(sql))?;
        Ok(pg_columns(statement.columns()).to_vec())
    }

    async fn open_cursor(&self, sql: &str, options: &CursorOptions) -> Result<Box<dyn Cursor>> {
        self.ensure_open()?;
        for stale in self.notices.lock().drain(..) {
            debug!("Notice from an earlier statement: {}", stale);
        }

        debug!(target: SQL_TRACE, "BEGIN READ ONLY");
        self.client
            .batch_execute("BEGIN READ ONLY")
            .await
            .map_err(|e| pg_error("starting read-only transaction", e).with_sql(sql))?;

        let mut cursor = PgCursor {
            client: Arc::clone(&self.client),
            notices: Arc::clone(&self.notices),
            layout: Layout::empty(),
            fetch_size: options.effective_fetch_size(),
            max_rows: options.max_rows.filter(|max| *max > 0),
            buffer: VecDeque::new(),
            position: 0,
            fetched_through: 0,
            exhausted: false,
            failed: false,
            open: true,
        };

        if let Err(e) = cursor.declare(sql, options).await {
            cursor.failed = true;
            let _ = cursor.close().await;
            return Err(e.with_sql(sql));
        }

        Ok(Box::new(cursor))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server-side cursor over one query, scoped to a read-only transaction
struct PgCursor {
    client: Arc<Client>,
    notices: Notices,
    layout: Layout,
    fetch_size: u32,
    max_rows: Option<u64>,
    buffer: VecDeque<SimpleQueryRow>,
    position: u64,
    /// Absolute number of the last row received from the server
    fetched_through: u64,
    exhausted: bool,
    failed: bool,
    open: bool,
}

impl PgCursor {
    async fn declare(&mut self, sql: &str, options: &CursorOptions) -> Result<()> {
        if let Some(timeout) = options.query_timeout {
            let set = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            debug!(target: SQL_TRACE, "{}", set);
            self.client
                .batch_execute(&set)
                .await
                .map_err(|e| pg_error("setting statement timeout", e))?;
        }

        debug!(target: SQL_TRACE, "prepare: {}", sql);
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| pg_error("preparing query", e))?;
        self.layout = Layout::of(&statement);

        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, sql);
        debug!(target: SQL_TRACE, "{}", declare);
        self.client
            .batch_execute(&declare)
            .await
            .map_err(|e| pg_error("declaring cursor", e))?;

        debug!(
            "Declared cursor with {} column(s), fetch size {}",
            self.layout.columns.len(),
            self.fetch_size
        );
        Ok(())
    }

    fn remaining(&self) -> Option<u64> {
        self.max_rows
            .map(|max| max.saturating_sub(self.fetched_through))
    }

    async fn fetch(&mut self) -> Result<()> {
        let mut count = u64::from(self.fetch_size);
        if let Some(remaining) = self.remaining() {
            count = count.min(remaining);
        }
        if count == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let fetch = format!("FETCH FORWARD {} FROM {}", count, CURSOR_NAME);
        debug!(target: SQL_TRACE, "{}", fetch);
        let messages = match self.client.simple_query(&fetch).await {
            Ok(messages) => messages,
            Err(e) => {
                self.failed = true;
                return Err(pg_error("fetching rows", e));
            }
        };

        let before = self.buffer.len();
        self.buffer.extend(text_rows(messages));
        let received = (self.buffer.len() - before) as u64;

        debug!("Fetched {} row(s) from cursor", received);
        if received < count {
            self.exhausted = true;
        }
        self.fetched_through += received;
        Ok(())
    }
}

#[async_trait]
impl Cursor for PgCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.layout.columns
    }

    async fn next(&mut self) -> Result<Option<Row>> {
        if !self.open {
            return Err(Error::query("cursor is closed"));
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch().await?;
        }
        match self.buffer.pop_front() {
            Some(text_row) => {
                self.position += 1;
                self.layout.decode(&text_row).map(Some)
            }
            None => Ok(None),
        }
    }

    fn row_number(&self) -> u64 {
        self.position
    }

    async fn absolute(&mut self, row: u64) -> Result<bool> {
        if self.position != 0 || !self.buffer.is_empty() {
            return Err(Error::unsupported(
                "absolute positioning is only supported before the first fetch",
            ));
        }

        let target = match self.max_rows {
            Some(max) => row.min(max),
            None => row,
        };

        let seek = format!("MOVE ABSOLUTE {} FROM {}", target, CURSOR_NAME);
        debug!(target: SQL_TRACE, "SAVEPOINT {}", SEEK_SAVEPOINT);
        self.client
            .batch_execute(&format!("SAVEPOINT {}", SEEK_SAVEPOINT))
            .await
            .map_err(|e| pg_error("creating savepoint", e))?;

        debug!(target: SQL_TRACE, "{}", seek);
        match self.client.execute(seek.as_str(), &[]).await {
            Ok(moved) => {
                let _ = self
                    .client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", SEEK_SAVEPOINT))
                    .await;
                // MOVE ABSOLUTE reports 1 when it lands on a row, 0 past the end.
                self.position = target;
                self.fetched_through = target;
                if moved == 0 {
                    self.exhausted = true;
                    return Ok(false);
                }
                Ok(target == row)
            }
            Err(e) => {
                debug!(target: SQL_TRACE, "ROLLBACK TO SAVEPOINT {}", SEEK_SAVEPOINT);
                self.client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", SEEK_SAVEPOINT))
                    .await
                    .map_err(|rollback| {
                        self.failed = true;
                        pg_error("rolling back savepoint", rollback)
                    })?;
                Err(Error::unsupported(format!("MOVE ABSOLUTE rejected: {}", e)))
            }
        }
    }

    fn take_warnings(&mut self) -> Vec<SourceWarning> {
        std::mem::take(&mut *self.notices.lock())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.buffer.clear();

        let end = if self.failed {
            "ROLLBACK".to_string()
        } else {
            format!("CLOSE {}; COMMIT", CURSOR_NAME)
        };

        debug!(target: SQL_TRACE, "{}", end);
        if let Err(e) = self.client.batch_execute(&end).await {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(pg_error("closing cursor", e));
        }
        Ok(())
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        let config = pg_config(params)?;
        let (client, mut connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        let notices: Notices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);

        tokio::spawn(async move {
            while let Some(message) =
                std::future::poll_fn(|cx| connection.poll_message(cx)).await
            {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        sink.lock().push(SourceWarning::new(
                            notice.code().code(),
                            notice.severity(),
                            notice.message(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("connection error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PgConnection::new(client, notices)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn supports(&self, url: &str) -> bool {
        let raw = url.strip_prefix("jdbc:").unwrap_or(url);
        raw.starts_with("postgresql:") || raw.starts_with("postgres:")
    }
}
