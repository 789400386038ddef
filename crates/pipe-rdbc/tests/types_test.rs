//! Tests for pipe-rdbc value types

use chrono::{NaiveDate, TimeZone, Utc};
use pipe_rdbc::prelude::*;
use rust_decimal::Decimal;
use std::str::FromStr;

// ==================== Canonical Text Tests ====================

#[test]
fn test_scalar_text() {
    assert_eq!(Value::Bool(true).to_string(), "true");
    assert_eq!(Value::Int64(-9_000_000_000).to_string(), "-9000000000");
    assert_eq!(Value::Float64(1.5).to_string(), "1.5");
    assert_eq!(
        Value::Decimal(Decimal::from_str("12345.6700").unwrap()).to_string(),
        "12345.6700"
    );
    assert_eq!(Value::String("a,b".into()).to_string(), "a,b");
}

#[test]
fn test_null_is_empty_text() {
    assert_eq!(Value::Null.to_string(), "");
    assert_eq!(Value::Null.to_string(), "");
}

#[test]
fn test_binary_text_is_prefixed_hex() {
    assert_eq!(Value::Bytes(vec![]).to_string(), "\\x");
    assert_eq!(Value::Bytes(vec![0x00, 0x0f, 0xff]).to_string(), "\\x000fff");
}

#[test]
fn test_server_text_is_not_binary() {
    let interval = Value::String("1 day 02:00:00".into());
    assert!(!interval.is_bytes());
    assert_eq!(interval.to_string(), "1 day 02:00:00");
}

#[test]
fn test_timestamp_text() {
    let dt = NaiveDate::from_ymd_opt(2023, 12, 31)
        .unwrap()
        .and_hms_milli_opt(23, 59, 58, 250)
        .unwrap();
    assert_eq!(Value::DateTime(dt).to_string(), "2023-12-31 23:59:58.250");

    let tz = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
    assert_eq!(Value::DateTimeTz(tz).to_string(), "2023-01-02 03:04:05+00:00");
}

#[test]
fn test_uuid_and_json_text() {
    let id = uuid::Uuid::nil();
    assert_eq!(
        Value::Uuid(id).to_string(),
        "00000000-0000-0000-0000-000000000000"
    );
    assert_eq!(
        Value::Json(serde_json::json!({"a": 1})).to_string(),
        "{\"a\":1}"
    );
}

// ==================== Row Tests ====================

#[test]
fn test_row_shares_columns() {
    let columns: Columns = vec![
        ColumnMetadata::new("id", "int8").with_ordinal(1),
        ColumnMetadata::new("payload", "bytea").with_ordinal(2),
    ]
    .into();
    let a = Row::new(columns.clone(), vec![Value::Int64(1), Value::Null]);
    let b = Row::new(columns, vec![Value::Int64(2), Value::Bytes(vec![1])]);

    assert_eq!(a.columns().as_ptr(), b.columns().as_ptr());
    assert_eq!(b.get_by_name("payload"), Some(&Value::Bytes(vec![1])));
    assert_eq!(a.into_values(), vec![Value::Int64(1), Value::Null]);
}
