//! Tests for the PostgreSQL backend against a live server
//!
//! **Requires Docker** - a PostgreSQL testcontainer is started per test.
//!
//! Run these tests explicitly with:
//!   cargo test -p pipe-rdbc --test postgres_test -- --ignored

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipe_rdbc::postgres::PgConnectionFactory;
use pipe_rdbc::prelude::*;
use std::io;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::NoTls;

const SERIES: &str = "select n, 'row-' || n as label from generate_series(1, 20) n";

/// Throwaway PostgreSQL server
struct PostgresContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    host: String,
    port: u16,
}

impl PostgresContainer {
    async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        let instance = Self {
            container,
            host,
            port,
        };
        instance.wait_for_ready().await?;
        Ok(instance)
    }

    fn conn_str(&self) -> String {
        format!(
            "host={} port={} user=postgres password=postgres dbname=postgres",
            self.host, self.port
        )
    }

    fn url(&self) -> String {
        format!(
            "jdbc:postgresql://{}:{}/postgres?user=postgres&password=postgres",
            self.host, self.port
        )
    }

    async fn wait_for_ready(&self) -> Result<()> {
        for _ in 0..60 {
            if tokio_postgres::connect(&self.conn_str(), NoTls).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("PostgreSQL did not become ready in time")
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.conn_str(), NoTls).await?;
        tokio::spawn(connection);
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn pool(&self) -> Result<Arc<dyn ConnectionPool>> {
        let pool: Arc<dyn ConnectionPool> = SimpleConnectionPool::new(
            PoolConfig::new(ConnectionParams::new(self.url())).with_max_size(2),
            Arc::new(PgConnectionFactory),
        )
        .await?;
        Ok(pool)
    }
}

/// Keeps every row as its text fields joined by `|`
#[derive(Default)]
struct Lines {
    header: Vec<String>,
    types: Vec<String>,
    rows: Vec<(u64, String)>,
    wants_columns: bool,
}

#[async_trait]
impl RowConsumer for Lines {
    fn wants_columns(&self) -> bool {
        self.wants_columns
    }

    async fn columns(&mut self, columns: &[ColumnMetadata]) -> io::Result<()> {
        self.header = columns.iter().map(|c| c.name.clone()).collect();
        self.types = columns.iter().map(|c| c.type_name.clone()).collect();
        Ok(())
    }

    async fn row(&mut self, row: Row, row_number: u64) -> io::Result<()> {
        let line = row
            .values()
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("|");
        self.rows.push((row_number, line));
        Ok(())
    }
}

async fn read(
    pool: &Arc<dyn ConnectionPool>,
    sql: &str,
    options: ReadOptions,
) -> (pipe_rdbc::Result<ReadSummary>, Lines) {
    let mut lines = Lines::default();
    let result = CursorReader::new(pool.clone(), sql, options)
        .read(&mut lines)
        .await;
    (result, lines)
}

fn first_field(lines: &Lines) -> Vec<(u64, String)> {
    lines
        .rows
        .iter()
        .map(|(n, line)| (*n, line.split('|').next().unwrap_or_default().to_string()))
        .collect()
}

// ==================== Window Tests ====================

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_offset_and_max_rows_window() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();

    // (fetch size, offset, max rows) -> absolute rows delivered
    let cases: [(u32, u64, Option<u64>, std::ops::RangeInclusive<u64>); 5] = [
        (3, 0, None, 1..=20),
        (3, 5, Some(12), 6..=12),
        (7, 0, Some(5), 1..=5),
        (1, 19, None, 20..=20),
        (4, 2, Some(100), 3..=20),
    ];

    for (fetch_size, offset, max_rows, expected) in cases {
        let (result, lines) = read(
            &pool,
            SERIES,
            ReadOptions::default()
                .with_fetch_size(fetch_size)
                .with_row_offset(offset)
                .with_max_rows(max_rows),
        )
        .await;

        let expected: Vec<_> = expected.map(|n| (n, n.to_string())).collect();
        assert_eq!(
            result.unwrap().rows,
            expected.len() as u64,
            "fetch {} offset {} max {:?}",
            fetch_size,
            offset,
            max_rows
        );
        assert_eq!(first_field(&lines), expected);
    }
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_offset_past_the_end_reads_nothing() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();

    let (result, lines) = read(&pool, SERIES, ReadOptions::default().with_row_offset(30)).await;

    let summary = result.unwrap();
    assert!(summary.cursor_opened);
    assert_eq!(summary.rows, 0);
    assert_eq!(lines.header, vec!["n", "label"]);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_empty_window_describes_columns() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();

    let mut lines = Lines {
        wants_columns: true,
        ..Default::default()
    };
    let summary = CursorReader::new(
        pool,
        SERIES,
        ReadOptions::default()
            .with_row_offset(4)
            .with_max_rows(Some(4)),
    )
    .read(&mut lines)
    .await
    .unwrap();

    assert!(!summary.cursor_opened);
    assert_eq!(lines.header, vec!["n", "label"]);
    assert_eq!(lines.types, vec!["int4", "text"]);
    assert!(lines.rows.is_empty());
}

// ==================== Value Rendering Tests ====================

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_values_render_as_server_text() {
    let pg = PostgresContainer::start().await.unwrap();
    pg.execute(
        "create table t (id int8, iv interval, n numeric, ip inet, b bytea, fa float4[], ok bool);
         insert into t values
           (1, interval '1 day', 1.5, inet '10.0.0.1', '\\xdeadbeef', '{1.5,2.5}', true),
           (2, null, 'NaN', null, null, null, false);",
    )
    .await
    .unwrap();
    let pool = pg.pool().await.unwrap();

    let (result, lines) = read(
        &pool,
        "select id, iv, n, ip, b, fa, ok from t order by id",
        ReadOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap().rows, 2);
    assert_eq!(
        lines.rows,
        vec![
            (1, "1|1 day|1.5|10.0.0.1|\\xdeadbeef|{1.5,2.5}|true".to_string()),
            (2, "2||NaN||||false".to_string()),
        ]
    );
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_numeric_beyond_fixed_precision() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();

    let (result, lines) = read(
        &pool,
        "select 1e40::numeric as n, 'Infinity'::float8 as f",
        ReadOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap().rows, 1);
    assert_eq!(lines.rows[0].1, format!("1{}|Infinity", "0".repeat(40)));
}

// ==================== Warning Tests ====================

async fn noisy_function(pg: &PostgresContainer) {
    pg.execute(
        "create function noisy(n int) returns int language plpgsql as $$
         begin
           raise warning 'noisy row %', n;
           return n;
         end $$;",
    )
    .await
    .unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_warnings_from_fetch_raised_in_strict_mode() {
    let pg = PostgresContainer::start().await.unwrap();
    noisy_function(&pg).await;
    let pool = pg.pool().await.unwrap();
    let sql = "select noisy(n) from generate_series(1, 2) n";

    let (result, lines) = read(&pool, sql, ReadOptions::default().with_ignore_warnings(false)).await;

    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Warning);
    assert!(err.to_string().contains("noisy row 1"));
    assert_eq!(err.sql(), Some(sql));
    assert!(lines.rows.is_empty());

    // The transaction was ended and the connection can be reused.
    let (result, lines) = read(&pool, sql, ReadOptions::default()).await;
    assert_eq!(result.unwrap().rows, 2);
    assert_eq!(first_field(&lines), vec![(1, "1".into()), (2, "2".into())]);
}

// ==================== Failure Tests ====================

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_statement_timeout_is_a_timeout() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();
    let sql = "select pg_sleep(5)";

    let (result, _) = read(
        &pool,
        sql,
        ReadOptions::default().with_query_timeout(Some(Duration::from_millis(200))),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert_eq!(err.sql(), Some(sql));

    let (result, _) = read(&pool, SERIES, ReadOptions::default()).await;
    assert_eq!(result.unwrap().rows, 20);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_bad_query_names_the_query() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();
    let sql = "select nme from missing_table";

    let (result, _) = read(&pool, sql, ReadOptions::default()).await;

    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.sql(), Some(sql));
    assert!(err.to_string().contains("42P01"));
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_transactions_do_not_leak_between_reads() {
    let pg = PostgresContainer::start().await.unwrap();
    let pool = pg.pool().await.unwrap();

    for _ in 0..3 {
        let (result, _) = read(&pool, "select 1/0", ReadOptions::default()).await;
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Query);

        let (result, _) = read(
            &pool,
            SERIES,
            ReadOptions::default().with_row_offset(10).with_fetch_size(4),
        )
        .await;
        assert_eq!(result.unwrap().rows, 10);
    }
}
