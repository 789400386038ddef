//! # pipe-export
//!
//! Streams the result of a query, or a static resource, to a sink as
//! delimited text without holding the full result in memory.
//!
//! ## Components
//!
//! - [`locator`]: classifies identifiers (`jdbc:`, `classpath:`, `file:`, `http:`)
//! - [`request`]: parses and validates export parameters
//! - [`encoder`]: encodes rows as delimited text, one flushed line per row
//! - [`export`]: wires it together per request
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipe_export::prelude::*;
//! use pipe_rdbc::prelude::{PoolSettings, SourceRegistry};
//!
//! let registry = Arc::new(SourceRegistry::postgres(PoolSettings::default()));
//! let exporter = Exporter::new(registry, ExportSettings::default());
//!
//! let plan = exporter.plan(&params)?;          // client errors surface here
//! let summary = exporter.run(plan, sink).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod encoder;
pub mod error;
pub mod export;
pub mod locator;
pub mod request;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::encoder::{CsvFormat, RowEncoder};
    pub use crate::error::{ExportError, Result};
    pub use crate::export::{ExportPlan, ExportSettings, ExportSummary, Exporter};
    pub use crate::locator::{classify, ByteResource, Resource, ResourceOpener};
    pub use crate::request::ExportRequest;

    pub use std::sync::Arc;
}

pub use error::{ExportError, Result};
pub use export::{Exporter, ExportSettings};
