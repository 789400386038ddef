//! Resource locator
//!
//! Classifies an export identifier by scheme prefix. The checks run in a
//! fixed order, first match wins:
//!
//! 1. `jdbc:` - queryable source
//! 2. `classpath:` - file under the configured bundle directory
//! 3. `file:` - local file system
//! 4. `http:` - plain HTTP resource
//!
//! Anything else is unsupported. [`classify`] is a pure function of the
//! identifier; opening a byte resource is a separate step done by
//! [`ResourceOpener`].

use futures::TryStreamExt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{ExportError, Result};
use pipe_rdbc::registry::QUERYABLE_PREFIX;

/// Bundle directory scheme
pub const CLASSPATH_PREFIX: &str = "classpath:";

/// Local file system scheme
pub const FILE_PREFIX: &str = "file:";

/// Plain HTTP scheme
pub const HTTP_PREFIX: &str = "http:";

/// Readable byte stream of an opened resource
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// What an identifier refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// A source that is read through a query
    Queryable(String),
    /// A resource copied byte for byte
    Bytes(ByteResource),
    /// No supported scheme; carries the identifier
    Unsupported(String),
}

/// A resource copied to the client without row semantics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteResource {
    /// Path relative to the bundle directory
    Bundle(String),
    /// Local file
    File(PathBuf),
    /// HTTP URL
    Http(String),
}

impl ByteResource {
    /// Short name for logs
    pub fn display_name(&self) -> String {
        match self {
            Self::Bundle(path) => path.clone(),
            Self::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Http(url) => url::Url::parse(url)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| url.clone()),
        }
    }
}

/// Classify an identifier by its scheme prefix
pub fn classify(identifier: &str) -> Resource {
    if identifier.starts_with(QUERYABLE_PREFIX) {
        return Resource::Queryable(identifier.to_string());
    }
    if let Some(path) = identifier.strip_prefix(CLASSPATH_PREFIX) {
        return Resource::Bytes(ByteResource::Bundle(
            path.trim_start_matches('/').to_string(),
        ));
    }
    if identifier.starts_with(FILE_PREFIX) {
        return Resource::Bytes(ByteResource::File(file_path(identifier)));
    }
    if identifier.starts_with(HTTP_PREFIX) {
        return Resource::Bytes(ByteResource::Http(identifier.to_string()));
    }
    Resource::Unsupported(identifier.to_string())
}

/// `file:///abs/path` is a URL; `file:path` is a plain path
fn file_path(identifier: &str) -> PathBuf {
    if identifier.starts_with("file://") {
        if let Some(path) = url::Url::parse(identifier)
            .ok()
            .and_then(|u| u.to_file_path().ok())
        {
            return path;
        }
    }
    PathBuf::from(&identifier[FILE_PREFIX.len()..])
}

/// Opens byte resources
#[derive(Debug, Clone)]
pub struct ResourceOpener {
    bundle_dir: PathBuf,
    http: reqwest::Client,
}

impl ResourceOpener {
    /// Create an opener resolving bundle paths against `bundle_dir`
    pub fn new(bundle_dir: impl Into<PathBuf>) -> Self {
        Self::with_client(bundle_dir, reqwest::Client::new())
    }

    /// Create an opener with a preconfigured HTTP client
    pub fn with_client(bundle_dir: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            http,
        }
    }

    /// Root of `classpath:` resources
    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Resolve a bundle path, rejecting paths that leave the bundle directory
    pub fn bundle_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if path.is_empty() || escapes {
            return Err(ExportError::bad_request(format!(
                "Invalid classpath resource [{}]",
                path
            )));
        }
        Ok(self.bundle_dir.join(relative))
    }

    /// Check the parts of a resource that can be checked without I/O
    pub fn validate(&self, resource: &ByteResource) -> Result<()> {
        if let ByteResource::Bundle(path) = resource {
            self.bundle_path(path)?;
        }
        Ok(())
    }

    /// Open `resource` for reading.
    ///
    /// HTTP resources answering with a non-success status fail here, before
    /// anything is copied.
    pub async fn open(&self, resource: &ByteResource) -> Result<ByteStream> {
        match resource {
            ByteResource::Bundle(path) => {
                let full = self.bundle_path(path)?;
                open_file(&full, resource).await
            }
            ByteResource::File(path) => open_file(path, resource).await,
            ByteResource::Http(url) => {
                let response = self
                    .http
                    .get(url.as_str())
                    .send()
                    .await
                    .map_err(|e| ExportError::resource(url.as_str(), io::Error::other(e)))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(ExportError::resource(
                        url.as_str(),
                        io::Error::other(format!("HTTP status {}", status)),
                    ));
                }
                debug!("Streaming [{}] ({})", url, status);

                let body = response.bytes_stream().map_err(io::Error::other);
                Ok(Box::new(StreamReader::new(Box::pin(body))))
            }
        }
    }
}

async fn open_file(path: &Path, resource: &ByteResource) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ExportError::resource(resource.display_name(), e))?;
    Ok(Box::new(file))
}
