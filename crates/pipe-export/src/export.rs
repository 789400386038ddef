//! Export orchestrator
//!
//! Validation and classification happen in [`Exporter::plan`], before
//! anything is written, so request errors never produce partial output.
//! [`Exporter::run`] then streams the plan into a sink:
//!
//! - queryable sources go through the source registry, a cursor reader and
//!   a row encoder bound to the sink
//! - byte resources are copied to the sink as they are
//!
//! A failure after the first byte truncates the output; the error is still
//! returned so the transport can mark the response incomplete.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use crate::encoder::RowEncoder;
use crate::error::{ExportError, Result};
use crate::locator::{classify, ByteResource, Resource, ResourceOpener};
use crate::request::ExportRequest;
use pipe_rdbc::reader::CursorReader;
use pipe_rdbc::registry::{SourceIdentity, SourceRegistry};

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Process-wide export policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    /// Log source warnings instead of failing on the first one
    pub ignore_warnings: bool,
    /// Statement timeout for queries
    pub query_timeout: Option<Duration>,
    /// Root of `classpath:` resources
    pub bundle_dir: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            ignore_warnings: true,
            query_timeout: None,
            bundle_dir: PathBuf::from("./resources"),
        }
    }
}

/// A validated export, ready to stream
#[derive(Debug, Clone)]
pub enum ExportPlan {
    /// Read `query` from a queryable source
    Query {
        /// Parsed request
        request: ExportRequest,
        /// Query to run
        query: String,
    },
    /// Copy a byte resource
    Copy {
        /// Resource to copy
        resource: ByteResource,
    },
}

/// Outcome of a finished export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Data rows written; zero for byte copies
    pub rows: u64,
    /// Bytes written to the sink
    pub bytes: u64,
    /// Wall time of the export
    pub elapsed: Duration,
}

/// Runs exports against the sources of one registry
pub struct Exporter {
    registry: Arc<SourceRegistry>,
    opener: ResourceOpener,
    settings: ExportSettings,
}

impl Exporter {
    /// Create an exporter
    pub fn new(registry: Arc<SourceRegistry>, settings: ExportSettings) -> Self {
        Self {
            opener: ResourceOpener::new(settings.bundle_dir.clone()),
            registry,
            settings,
        }
    }

    /// Replace the byte resource opener
    pub fn with_opener(mut self, opener: ResourceOpener) -> Self {
        self.opener = opener;
        self
    }

    /// The source registry
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Export settings
    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Validate `params` and decide what to stream
    pub fn plan(&self, params: &HashMap<String, String>) -> Result<ExportPlan> {
        let request = ExportRequest::from_params(params)?;

        match classify(&request.url) {
            Resource::Queryable(_) => {
                let query = request.require_query()?.to_string();
                Ok(ExportPlan::Query { request, query })
            }
            Resource::Bytes(resource) => {
                self.opener.validate(&resource)?;
                Ok(ExportPlan::Copy { resource })
            }
            Resource::Unsupported(url) => Err(ExportError::UnsupportedResource(url)),
        }
    }

    /// Plan and run in one step
    pub async fn export<W>(&self, params: &HashMap<String, String>, sink: W) -> Result<ExportSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let plan = self.plan(params)?;
        self.run(plan, sink).await
    }

    /// Stream `plan` into `sink`, closing the sink when done
    pub async fn run<W>(&self, plan: ExportPlan, sink: W) -> Result<ExportSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();

        let (label, result) = match plan {
            ExportPlan::Query { request, query } => {
                let label = query.clone();
                (label, self.export_query(request, query, sink).await)
            }
            ExportPlan::Copy { resource } => {
                let label = resource.display_name();
                (label, self.copy_resource(resource, sink).await)
            }
        };

        match result {
            Ok((rows, bytes)) => {
                let summary = ExportSummary {
                    rows,
                    bytes,
                    elapsed: started.elapsed(),
                };
                info!(
                    "Export of [{}] finished: {} rows, {} bytes in {:?}",
                    label, summary.rows, summary.bytes, summary.elapsed
                );
                Ok(summary)
            }
            Err(e) if e.is_sink_failure() => {
                info!("Export of [{}] abandoned by the client: {}", label, e);
                Err(e)
            }
            Err(e) => {
                error!("Export of [{}] failed: {}", label, e);
                Err(e)
            }
        }
    }

    async fn export_query<W>(
        &self,
        request: ExportRequest,
        query: String,
        sink: W,
    ) -> Result<(u64, u64)>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let identity = SourceIdentity::from_url(&request.url);
        let pool = self.registry.acquire(&identity, &request.connection).await?;
        let version = self.registry.database_version(&pool).await;

        info!(
            "Connecting to source [{}] ({}) to copy [{}] from offset {} to limit {} with fetch size {}",
            identity,
            version.as_deref().unwrap_or("unknown version"),
            query,
            request.row_offset,
            request.max_rows.map_or(-1, |max| max as i64),
            request.fetch_size
        );

        let options = request
            .read_options()
            .with_query_timeout(self.settings.query_timeout)
            .with_ignore_warnings(self.settings.ignore_warnings);
        let reader = CursorReader::new(pool, query, options);

        let mut encoder = RowEncoder::new(sink, request.format);
        let read = reader.read(&mut encoder).await;
        let closed = encoder.close().await;

        read?;
        closed.map_err(ExportError::Sink)?;
        Ok((encoder.rows_written(), encoder.bytes_written()))
    }

    async fn copy_resource<W>(&self, resource: ByteResource, mut sink: W) -> Result<(u64, u64)>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let name = resource.display_name();
        info!("Copying from [{}]", name);

        let mut input = self.opener.open(&resource).await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut bytes = 0u64;
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| ExportError::resource(name.as_str(), e))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await.map_err(ExportError::Sink)?;
            bytes += n as u64;
        }
        sink.flush().await.map_err(ExportError::Sink)?;
        sink.shutdown().await.map_err(ExportError::Sink)?;
        Ok((0, bytes))
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}
