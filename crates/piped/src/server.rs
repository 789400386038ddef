//! HTTP front end
//!
//! `GET /download` and `GET /copy` run an export and stream it as the
//! response body. A request is validated before the response starts, and
//! the first body chunk is awaited before headers go out, so failures up to
//! that point get a proper status. Later failures abort the body.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::body::{BodyChunk, ChannelWriter};
use crate::config::PipedConfig;
use pipe_export::{ExportError, Exporter};
use pipe_rdbc::registry::SourceSummary;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    exporter: Arc<Exporter>,
    stream_buffer: usize,
}

impl AppState {
    /// Create handler state around an exporter
    pub fn new(exporter: Arc<Exporter>, stream_buffer: usize) -> Self {
        Self {
            exporter,
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// The exporter behind the handlers
    pub fn exporter(&self) -> &Arc<Exporter> {
        &self.exporter
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub error_code: u16,
    /// Human readable message
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Build the service router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/download", get(export_handler))
        .route("/copy", get(export_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

async fn sources_handler(State(state): State<AppState>) -> Json<Vec<SourceSummary>> {
    Json(state.exporter.registry().sources())
}

async fn export_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let plan = match state.exporter.plan(&params) {
        Ok(plan) => plan,
        Err(e) => return error_response(&e),
    };

    let (tx, mut rx) = mpsc::channel::<BodyChunk>(state.stream_buffer);
    let writer = ChannelWriter::new(tx.clone());
    let exporter = Arc::clone(&state.exporter);
    tokio::spawn(async move {
        if let Err(e) = exporter.run(plan, writer).await {
            if !e.is_sink_failure() {
                // Nobody is listening when this fails too.
                let _ = tx.send(Err(e)).await;
            }
        }
    });

    let first = match rx.recv().await {
        Some(Err(e)) => return error_response(&e),
        first => first,
    };

    let stream = futures::stream::iter(first)
        .chain(ReceiverStream::new(rx))
        .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

fn error_response(err: &ExportError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    debug!("Rejecting export with {}: {}", status, err);
    (
        status,
        Json(ErrorResponse {
            error_code: status.as_u16(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

/// Serve until a shutdown signal arrives, then close all source pools
pub async fn serve(config: &PipedConfig, exporter: Arc<Exporter>) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(Arc::clone(&exporter), config.server.stream_buffer);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    info!("Closing source pools");
    exporter.registry().close().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
