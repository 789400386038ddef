//! Row encoder
//!
//! Turns rows into lines of delimited text and writes them to an async sink
//! one line at a time.
//!
//! Field rules, applied in column order and joined by the delimiter:
//!
//! - `NULL` is the empty string, never quoted
//! - binary values are `\x` followed by lower-case hex, quoted only when
//!   quoting is forced
//! - any other value uses its canonical text; text containing the delimiter
//!   or the quote sequence is wrapped in quotes with every embedded quote
//!   replaced by the escape sequence; with forced quoting every such field is
//!   wrapped
//!
//! The optional header is written once, before the first row, from the
//! column names without escaping.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use pipe_rdbc::reader::RowConsumer;
use pipe_rdbc::types::{ColumnMetadata, Row, Value};

const LINE_ENDING: &str = "\n";

/// Delimited text format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFormat {
    /// Field separator
    pub delimiter: String,
    /// Quote sequence
    pub quote: String,
    /// Replacement for quotes embedded in a field
    pub escape: String,
    /// Write a header line with the column names
    pub print_header: bool,
    /// Quote every non-null field
    pub print_quotes: bool,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            quote: "\"".to_string(),
            escape: "\"\"".to_string(),
            print_header: false,
            print_quotes: false,
        }
    }
}

impl CsvFormat {
    /// Whether `text` must be quoted and escaped
    fn needs_escaping(&self, text: &str) -> bool {
        (!self.delimiter.is_empty() && text.contains(self.delimiter.as_str()))
            || (!self.quote.is_empty() && text.contains(self.quote.as_str()))
    }

    /// Append one encoded field to `out`
    pub fn encode_field(&self, value: &Value, out: &mut String) {
        match value {
            Value::Null => {}
            v if v.is_bytes() => {
                let quoted = self.print_quotes;
                if quoted {
                    out.push_str(&self.quote);
                }
                // Writing into a String cannot fail.
                let _ = write!(out, "{}", v);
                if quoted {
                    out.push_str(&self.quote);
                }
            }
            v => {
                let text = v.to_string();
                if self.needs_escaping(&text) {
                    out.push_str(&self.quote);
                    out.push_str(&text.replace(self.quote.as_str(), &self.escape));
                    out.push_str(&self.quote);
                } else if self.print_quotes {
                    out.push_str(&self.quote);
                    out.push_str(&text);
                    out.push_str(&self.quote);
                } else {
                    out.push_str(&text);
                }
            }
        }
    }

    /// Append one encoded row, including the line break, to `out`
    pub fn encode_row(&self, values: &[Value], out: &mut String) {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                out.push_str(&self.delimiter);
            }
            self.encode_field(value, out);
        }
        out.push_str(LINE_ENDING);
    }

    /// Append the header line to `out`
    pub fn encode_header(&self, columns: &[ColumnMetadata], out: &mut String) {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                out.push_str(&self.delimiter);
            }
            out.push_str(&column.name);
        }
        out.push_str(LINE_ENDING);
    }
}

/// Writes encoded rows to a sink, flushing after every line
pub struct RowEncoder<W> {
    sink: W,
    format: CsvFormat,
    header_pending: bool,
    line: String,
    rows: u64,
    bytes: u64,
}

impl<W: AsyncWrite + Unpin + Send> RowEncoder<W> {
    /// Create an encoder writing to `sink`
    pub fn new(sink: W, format: CsvFormat) -> Self {
        Self {
            sink,
            header_pending: format.print_header,
            format,
            line: String::new(),
            rows: 0,
            bytes: 0,
        }
    }

    /// Write the header line if enabled and not yet written
    pub async fn write_header(&mut self, columns: &[ColumnMetadata]) -> io::Result<()> {
        if !self.header_pending {
            return Ok(());
        }
        self.header_pending = false;
        self.line.clear();
        self.format.encode_header(columns, &mut self.line);
        self.emit().await
    }

    /// Encode one row and write it to the sink
    pub async fn write_row(&mut self, row: &Row) -> io::Result<()> {
        self.line.clear();
        self.format.encode_row(row.values(), &mut self.line);
        self.emit().await?;
        self.rows += 1;
        Ok(())
    }

    async fn emit(&mut self) -> io::Result<()> {
        self.sink.write_all(self.line.as_bytes()).await?;
        self.sink.flush().await?;
        self.bytes += self.line.len() as u64;
        Ok(())
    }

    /// Data rows written so far
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Bytes written so far, header included
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Shut the sink down
    pub async fn close(&mut self) -> io::Result<()> {
        self.sink.shutdown().await
    }

    /// Unwrap the sink
    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RowConsumer for RowEncoder<W> {
    fn wants_columns(&self) -> bool {
        self.header_pending
    }

    async fn columns(&mut self, columns: &[ColumnMetadata]) -> io::Result<()> {
        self.write_header(columns).await
    }

    async fn row(&mut self, row: Row, _row_number: u64) -> io::Result<()> {
        self.write_row(&row).await
    }
}
