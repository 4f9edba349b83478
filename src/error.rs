//! Error taxonomy for the session server.
//!
//! Mirrors the kinds (not concrete-per-site types) described for the
//! server: client mistakes, illegal state transitions, resource
//! exhaustion, transient I/O that is retried and never surfaced, and
//! startup-fatal conditions. `TransientIOError` intentionally has no
//! HTTP mapping — it never escapes the event loop.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Errors surfaced to an HTTP caller or to the CLI.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Client(String),

    #[error("session is not running")]
    NotRunning,

    #[error("session process has died")]
    ProcessGone,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures allocating or tearing down host resources (PTYs, directories,
/// file handles). Always surfaced as 500s; the caller is responsible for
/// rolling back any partial state before propagating this.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to allocate pty: {0}")]
    Spawn(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Raised by the health-probe loop after N consecutive failures; consumed
/// internally by the supervisor, never surfaced over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("health probe failed {failures} times consecutively: {last}")]
    HealthCheckFailed { failures: u32, last: String },
}

/// Conditions that prevent the server from starting at all: it fails the
/// process, not a request.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("cannot create control root at {path}: {source}")]
    ControlRoot {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Client(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotRunning => (
                StatusCode::BAD_REQUEST,
                "session is not running".to_string(),
            ),
            AppError::ProcessGone => (StatusCode::GONE, "Session process has died".to_string()),
            AppError::NotFound(id) => (StatusCode::NOT_FOUND, format!("session not found: {id}")),
            AppError::Resource(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
