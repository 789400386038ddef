//! Error types for pipe-export
//!
//! Every failure falls into one of four classes, which decides how the
//! HTTP layer reports it:
//!
//! | Variant                                | Class             | Status |
//! |----------------------------------------|-------------------|--------|
//! | `BadRequest`, `UnsupportedResource`     | client request    | 400    |
//! | `Source`, `Resource`                    | source access     | 500    |
//! | `Sink`                                  | abandoned by sink | 500    |
//! | `Consistency`                           | internal          | 500    |

use std::io;
use thiserror::Error;

/// Result type alias for pipe-export
pub type Result<T> = std::result::Result<T, ExportError>;

/// Main error type for pipe-export
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ExportError {
    /// Missing or invalid request parameter
    #[error("{0}")]
    BadRequest(String),

    /// Identifier with no supported scheme
    #[error("Unsupported url: {0}")]
    UnsupportedResource(String),

    /// Queryable source failed (pool, connection, statement, strict warning)
    #[error("source access failed: {0}")]
    Source(#[source] pipe_rdbc::Error),

    /// Byte resource could not be opened or read
    #[error("resource [{resource}] failed: {source}")]
    Resource {
        resource: String,
        #[source]
        source: io::Error,
    },

    /// The sink stopped accepting bytes
    #[error("sink failure: {0}")]
    Sink(#[source] io::Error),

    /// Cursor position diverged from the delivered row count
    #[error("internal consistency failure: expected row {expected}, cursor at {actual}")]
    Consistency { expected: u64, actual: u64 },
}

impl ExportError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Create a resource error
    pub fn resource(resource: impl Into<String>, source: io::Error) -> Self {
        Self::Resource {
            resource: resource.into(),
            source,
        }
    }

    /// Whether the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::BadRequest(_) | Self::UnsupportedResource(_))
    }

    /// Whether the sink went away; nobody is left to report to
    pub fn is_sink_failure(&self) -> bool {
        matches!(self, Self::Sink(_))
    }

    /// HTTP status code reported for this error
    pub fn http_status(&self) -> u16 {
        if self.is_client_error() {
            400
        } else {
            500
        }
    }
}

impl From<pipe_rdbc::Error> for ExportError {
    fn from(err: pipe_rdbc::Error) -> Self {
        match err {
            pipe_rdbc::Error::Sink { source } => Self::Sink(source),
            pipe_rdbc::Error::Consistency { expected, actual } => {
                Self::Consistency { expected, actual }
            }
            other => Self::Source(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_400() {
        assert_eq!(ExportError::bad_request("Missing required param [url]").http_status(), 400);
        assert_eq!(
            ExportError::UnsupportedResource("ftp://x".into()).http_status(),
            400
        );
    }

    #[test]
    fn test_unsupported_message_names_identifier() {
        let err = ExportError::UnsupportedResource("ftp://files.example.com/a.csv".into());
        assert_eq!(err.to_string(), "Unsupported url: ftp://files.example.com/a.csv");
    }

    #[test]
    fn test_rdbc_errors_are_classified() {
        let err: ExportError = pipe_rdbc::Error::query("boom").into();
        assert!(matches!(err, ExportError::Source(_)));
        assert_eq!(err.http_status(), 500);

        let err: ExportError =
            pipe_rdbc::Error::sink(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into();
        assert!(err.is_sink_failure());

        let err: ExportError = pipe_rdbc::Error::Consistency {
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(matches!(
            err,
            ExportError::Consistency {
                expected: 3,
                actual: 4
            }
        ));
        assert_eq!(err.http_status(), 500);
    }
}
