//! Export request parameters
//!
//! Parsed once per request from the raw parameter map and immutable
//! afterwards.
//!
//! | Parameter     | Default    | Meaning                                   |
//! |---------------|------------|-------------------------------------------|
//! | `url`         | (required) | source identifier                         |
//! | `query`       |            | SQL text, wins over `table`               |
//! | `table`       |            | expanded to `select * from <table>`       |
//! | `rowOffset`   | `0`        | leading rows to skip                      |
//! | `maxRows`     | `-1`       | cap on the absolute row number, -1 = none |
//! | `fetchSize`   | `256`      | rows per round trip                       |
//! | `delimiter`   | `,`        | field separator                           |
//! | `quoteChar`   | `"`        | quote sequence                            |
//! | `escapeChar`  | `""`       | replacement for embedded quotes           |
//! | `printHeader` | `false`    | write column names first                  |
//! | `printQuotes` | `false`    | quote every non-null field                |
//! | `user`        |            | source user                               |
//! | `password`    |            | source password                           |
//!
//! Numbers may contain `_` as a digit separator.

use std::collections::HashMap;
use std::str::FromStr;

use crate::encoder::CsvFormat;
use crate::error::{ExportError, Result};
use pipe_rdbc::connection::{ConnectionParams, DEFAULT_FETCH_SIZE};
use pipe_rdbc::reader::ReadOptions;

/// A validated export request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Source identifier
    pub url: String,
    /// Query text, explicit or derived from a table name
    pub query: Option<String>,
    /// Leading rows to skip
    pub row_offset: u64,
    /// Cap on the absolute row number
    pub max_rows: Option<u64>,
    /// Rows per round trip
    pub fetch_size: u32,
    /// Text format
    pub format: CsvFormat,
    /// Connection parameters for queryable sources
    pub connection: ConnectionParams,
}

impl ExportRequest {
    /// Parse and validate request parameters
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let connection = ConnectionParams::from_map(params)
            .ok_or_else(|| ExportError::bad_request("Missing required param [url]"))?;

        let query = match (params.get("query"), params.get("table")) {
            (Some(query), _) => Some(query.clone()),
            (None, Some(table)) => Some(format!("select * from {}", table)),
            (None, None) => None,
        };

        let max_rows = match parse_number::<i64>(params, "maxRows")? {
            None | Some(-1) => None,
            Some(n) if n >= 0 => Some(n as u64),
            Some(n) => {
                return Err(ExportError::bad_request(format!(
                    "Invalid value for [maxRows]: {} (expected -1 or a non-negative number)",
                    n
                )))
            }
        };

        let defaults = CsvFormat::default();
        let format = CsvFormat {
            delimiter: text(params, "delimiter", defaults.delimiter),
            quote: text(params, "quoteChar", defaults.quote),
            escape: text(params, "escapeChar", defaults.escape),
            print_header: parse_flag(params, "printHeader")?.unwrap_or(defaults.print_header),
            print_quotes: parse_flag(params, "printQuotes")?.unwrap_or(defaults.print_quotes),
        };

        Ok(Self {
            url: connection.url.clone(),
            query,
            row_offset: parse_number(params, "rowOffset")?.unwrap_or(0),
            max_rows,
            fetch_size: parse_number(params, "fetchSize")?.unwrap_or(DEFAULT_FETCH_SIZE),
            format,
            connection,
        })
    }

    /// The query to run against a queryable source
    pub fn require_query(&self) -> Result<&str> {
        self.query
            .as_deref()
            .ok_or_else(|| ExportError::bad_request("Missing both [table] and [query]"))
    }

    /// Cursor read options for this request
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::default()
            .with_fetch_size(self.fetch_size)
            .with_row_offset(self.row_offset)
            .with_max_rows(self.max_rows)
    }
}

fn text(params: &HashMap<String, String>, name: &str, default: String) -> String {
    params.get(name).cloned().unwrap_or(default)
}

fn parse_number<T: FromStr>(params: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    let Some(raw) = params.get(name) else {
        return Ok(None);
    };
    let digits: String = raw.trim().chars().filter(|c| *c != '_').collect();
    digits.parse().map(Some).map_err(|_| {
        ExportError::bad_request(format!("Invalid value for [{}]: {}", name, raw))
    })
}

fn parse_flag(params: &HashMap<String, String>, name: &str) -> Result<Option<bool>> {
    let Some(raw) = params.get(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(Some(true)),
        "false" | "off" | "no" | "0" => Ok(Some(false)),
        _ => Err(ExportError::bad_request(format!(
            "Invalid value for [{}]: {}",
            name, raw
        ))),
    }
}
