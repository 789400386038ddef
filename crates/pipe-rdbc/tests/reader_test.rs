//! Tests for pipe-rdbc cursor reader

use async_trait::async_trait;
use pipe_rdbc::memory::{MemoryConnectionFactory, MemoryDatabase};
use pipe_rdbc::prelude::*;
use std::io;

const QUERY: &str = "select * from numbers";

fn numbers(count: i32) -> MemoryDatabase {
    MemoryDatabase::new().with_table(
        "numbers",
        &[("n", "int4"), ("label", "text")],
        (1..=count)
            .map(|n| vec![Value::Int32(n), Value::String(format!("row-{}", n))])
            .collect(),
    )
}

async fn pool_for(db: &MemoryDatabase) -> Arc<dyn ConnectionPool> {
    SimpleConnectionPool::new(
        PoolConfig::new(ConnectionParams::new("memory://numbers")),
        Arc::new(MemoryConnectionFactory::new(db.clone())),
    )
    .await
    .unwrap()
}

#[derive(Default)]
struct Collect {
    header: Option<Vec<String>>,
    rows: Vec<(u64, i64)>,
    wants_columns: bool,
    fail_at: Option<usize>,
}

#[async_trait]
impl RowConsumer for Collect {
    fn wants_columns(&self) -> bool {
        self.wants_columns
    }

    async fn columns(&mut self, columns: &[ColumnMetadata]) -> io::Result<()> {
        self.header = Some(columns.iter().map(|c| c.name.clone()).collect());
        Ok(())
    }

    async fn row(&mut self, row: Row, row_number: u64) -> io::Result<()> {
        if self.fail_at == Some(self.rows.len()) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        let n = row.get(0).and_then(Value::as_i64).unwrap_or_default();
        self.rows.push((row_number, n));
        Ok(())
    }
}

async fn read(db: &MemoryDatabase, options: ReadOptions) -> (Result<ReadSummary>, Collect) {
    let pool = pool_for(db).await;
    let mut consumer = Collect::default();
    let result = CursorReader::new(pool, QUERY, options)
        .read(&mut consumer)
        .await;
    (result, consumer)
}

// ==================== Window Tests ====================

#[tokio::test]
async fn test_reads_every_row_in_order() {
    let db = numbers(10);
    let (result, consumer) = read(&db, ReadOptions::default()).await;

    let summary = result.unwrap();
    assert_eq!(summary.rows, 10);
    assert!(summary.cursor_opened);
    assert_eq!(consumer.header, Some(vec!["n".to_string(), "label".to_string()]));
    let expected: Vec<_> = (1..=10).map(|n| (n as u64, n as i64)).collect();
    assert_eq!(consumer.rows, expected);
}

#[tokio::test]
async fn test_offset_skips_leading_rows() {
    let db = numbers(10);
    let (result, consumer) = read(&db, ReadOptions::default().with_row_offset(3)).await;

    assert_eq!(result.unwrap().rows, 7);
    assert_eq!(consumer.rows.first(), Some(&(4, 4)));
    assert_eq!(consumer.rows.last(), Some(&(10, 10)));
}

#[tokio::test]
async fn test_max_rows_counts_skipped_rows() {
    let db = numbers(10);
    let options = ReadOptions::default()
        .with_row_offset(2)
        .with_max_rows(Some(5));
    let (result, consumer) = read(&db, options).await;

    assert_eq!(result.unwrap().rows, 3);
    assert_eq!(consumer.rows, vec![(3, 3), (4, 4), (5, 5)]);
}

#[tokio::test]
async fn test_offset_past_end_yields_nothing() {
    let db = numbers(4);
    let (result, consumer) = read(&db, ReadOptions::default().with_row_offset(10)).await;

    let summary = result.unwrap();
    assert_eq!(summary.rows, 0);
    assert!(summary.cursor_opened);
    assert!(consumer.rows.is_empty());
}

#[tokio::test]
async fn test_fallback_positioning_matches_absolute() {
    for offset in [0, 1, 5, 9, 10, 12] {
        let absolute = numbers(10);
        let sequential = numbers(10);
        sequential.set_supports_absolute(false);

        let options = ReadOptions::default()
            .with_fetch_size(3)
            .with_row_offset(offset);
        let (a, with_absolute) = read(&absolute, options.clone()).await;
        let (b, with_fallback) = read(&sequential, options).await;

        assert_eq!(a.unwrap().rows, b.unwrap().rows, "offset {}", offset);
        assert_eq!(with_absolute.rows, with_fallback.rows, "offset {}", offset);
    }
}

#[tokio::test]
async fn test_absolute_positioning_skips_fetching() {
    let db = numbers(100);
    let options = ReadOptions::default()
        .with_fetch_size(10)
        .with_row_offset(90);
    let (result, _) = read(&db, options).await;

    assert_eq!(result.unwrap().rows, 10);
    let counters = db.counters();
    assert_eq!(counters.absolute_calls, 1);
    assert_eq!(counters.rows_fetched, 10);
}

#[tokio::test]
async fn test_empty_window_opens_no_cursor() {
    let db = numbers(10);
    let options = ReadOptions::default()
        .with_row_offset(5)
        .with_max_rows(Some(5));
    let (result, consumer) = read(&db, options).await;

    let summary = result.unwrap();
    assert_eq!(summary, ReadSummary::default());
    assert!(consumer.rows.is_empty());
    assert!(consumer.header.is_none());
    assert_eq!(db.counters().cursors_opened, 0);
}

#[tokio::test]
async fn test_empty_window_describes_columns_when_wanted() {
    let db = numbers(10);
    let pool = pool_for(&db).await;
    let mut consumer = Collect {
        wants_columns: true,
        ..Default::default()
    };

    let summary = CursorReader::new(pool, QUERY, ReadOptions::default().with_max_rows(Some(0)))
        .read(&mut consumer)
        .await
        .unwrap();

    assert!(!summary.cursor_opened);
    assert_eq!(consumer.header, Some(vec!["n".to_string(), "label".to_string()]));
    assert!(consumer.rows.is_empty());
    assert_eq!(db.counters().cursors_opened, 0);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_sink_failure_stops_fetching() {
    let db = numbers(1_000);
    let pool = pool_for(&db).await;
    let mut consumer = Collect {
        fail_at: Some(5),
        ..Default::default()
    };

    let err = CursorReader::new(
        pool.clone(),
        QUERY,
        ReadOptions::default().with_fetch_size(16),
    )
    .read(&mut consumer)
    .await
    .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Sink);
    assert_eq!(consumer.rows.len(), 5);

    let counters = db.counters();
    assert!(counters.rows_fetched <= 5 + 16);
    assert_eq!(counters.cursors_opened, 1);
    assert_eq!(counters.cursors_closed, 1);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.idle(), 1);
}

#[tokio::test]
async fn test_source_failure_carries_query() {
    let db = numbers(10);
    db.set_fail_after(Some(4));
    let pool = pool_for(&db).await;
    let mut consumer = Collect::default();

    let err = CursorReader::new(pool.clone(), QUERY, ReadOptions::default())
        .read(&mut consumer)
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.sql(), Some(QUERY));
    assert_eq!(consumer.rows.len(), 4);
    assert_eq!(db.counters().cursors_closed, 1);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_unknown_relation_is_query_error() {
    let db = numbers(1);
    let pool = pool_for(&db).await;
    let mut consumer = Collect::default();

    let err = CursorReader::new(pool.clone(), "select * from missing", ReadOptions::default())
        .read(&mut consumer)
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.sql(), Some("select * from missing"));
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_row_number_mismatch_is_consistency_error() {
    let db = numbers(10);
    db.set_misreport_row(Some(3));
    let (result, consumer) = read(&db, ReadOptions::default()).await;

    match result.unwrap_err() {
        Error::Consistency { expected, actual } => {
            assert_eq!(expected, 3);
            assert_eq!(actual, 4);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(consumer.rows.len(), 2);
    assert_eq!(db.counters().cursors_closed, 1);
}

// ==================== Warning Tests ====================

#[tokio::test]
async fn test_warnings_ignored_by_default() {
    let db = numbers(3);
    db.add_warning(SourceWarning::new("01000", "WARNING", "plan is not optimal"));
    let (result, consumer) = read(&db, ReadOptions::default()).await;

    assert_eq!(result.unwrap().rows, 3);
    assert_eq!(consumer.rows.len(), 3);
}

#[tokio::test]
async fn test_warnings_raised_in_strict_mode() {
    let db = numbers(3);
    db.add_warning(SourceWarning::new("01000", "WARNING", "plan is not optimal"));
    let pool = pool_for(&db).await;
    let mut consumer = Collect::default();

    let err = CursorReader::new(
        pool.clone(),
        QUERY,
        ReadOptions::default().with_ignore_warnings(false),
    )
    .read(&mut consumer)
    .await
    .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Warning);
    assert!(err.to_string().contains("plan is not optimal"));
    assert!(consumer.rows.is_empty());
    assert_eq!(db.counters().cursors_closed, 1);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_warning_raised_mid_stream_in_strict_mode() {
    let db = numbers(6);
    db.add_warning_at_row(
        4,
        SourceWarning::new("01000", "WARNING", "row 4 was truncated"),
    );
    let pool = pool_for(&db).await;
    let mut consumer = Collect::default();

    let err = CursorReader::new(
        pool.clone(),
        QUERY,
        ReadOptions::default()
            .with_fetch_size(2)
            .with_ignore_warnings(false),
    )
    .read(&mut consumer)
    .await
    .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Warning);
    assert!(err.to_string().contains("row 4 was truncated"));
    assert_eq!(err.sql(), Some(QUERY));
    // Rows 3 and 4 arrive in the same fetch; neither is delivered.
    assert_eq!(consumer.rows, vec![(1, 1), (2, 2)]);
    assert_eq!(db.counters().cursors_closed, 1);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_warning_raised_while_fast_forwarding() {
    let db = numbers(6);
    db.set_supports_absolute(false);
    db.add_warning_at_row(2, SourceWarning::new("01000", "WARNING", "skipped row noise"));

    let (result, consumer) = read(
        &db,
        ReadOptions::default()
            .with_row_offset(3)
            .with_fetch_size(1)
            .with_ignore_warnings(false),
    )
    .await;

    assert_eq!(result.unwrap_err().category(), ErrorCategory::Warning);
    assert!(consumer.rows.is_empty());
}

#[tokio::test]
async fn test_mid_stream_warning_logged_when_ignored() {
    let db = numbers(6);
    db.add_warning_at_row(5, SourceWarning::new("01000", "WARNING", "late notice"));

    let (result, consumer) = read(&db, ReadOptions::default().with_fetch_size(2)).await;

    assert_eq!(result.unwrap().rows, 6);
    assert_eq!(consumer.rows.len(), 6);
}

// ==================== Error Context Tests ====================

#[tokio::test]
async fn test_connection_failure_carries_query() {
    let db = numbers(3);
    let pool: Arc<dyn ConnectionPool> = SimpleConnectionPool::new(
        PoolConfig::new(ConnectionParams::new("memory://numbers"))
            .with_validation_window(Some(std::time::Duration::ZERO)),
        Arc::new(MemoryConnectionFactory::new(db.clone())),
    )
    .await
    .unwrap();
    db.set_unavailable(true);

    let mut consumer = Collect::default();
    let err = CursorReader::new(pool, QUERY, ReadOptions::default())
        .read(&mut consumer)
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(err.sql(), Some(QUERY));
    assert!(err.to_string().contains(QUERY));
}
