//! Session lifecycle and streaming endpoints (spec §4.7).

use super::AppState;
use crate::error::AppError;
use crate::multiplexer::{self, Frame};
use crate::session::CreateSessionSpec;
use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Serialize)]
pub struct HealthResponse {
    ok: bool,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { ok: true, uptime_seconds: state.supervisor.uptime().as_secs() })
}

#[derive(Serialize)]
pub struct SessionMetadata {
    id: String,
    command: String,
    cwd: String,
    status: crate::session::Status,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(rename = "startedAt")]
    started_at: DateTime<Utc>,
    #[serde(rename = "lastModified")]
    last_modified: DateTime<Utc>,
    pid: i32,
}

fn to_metadata(session: &crate::session::Session) -> SessionMetadata {
    SessionMetadata {
        id: session.id.clone(),
        command: session.command.join(" "),
        cwd: session.cwd.display().to_string(),
        status: session.status(),
        exit_code: session.exit_code(),
        started_at: session.started_at,
        last_modified: session.last_modified(),
        pid: session.pid(),
    }
}

/// `GET /api/sessions` — ordered by `lastModified` descending (spec §4.5
/// `list`).
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionMetadata>> {
    let mut sessions: Vec<_> = state.registry.list().iter().map(|s| to_metadata(s)).collect();
    sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    Json(sessions)
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    command: Vec<String>,
    #[serde(rename = "workingDir")]
    working_dir: Option<String>,
    term: Option<String>,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    success: bool,
    #[serde(rename = "sessionId")]
    session_id: String,
    message: String,
}

/// `POST /api/sessions` (spec §4.7).
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    let spec = CreateSessionSpec::new(
        body.command,
        body.working_dir,
        body.term,
        state.registry.default_term(),
    )
    .map_err(AppError::Client)?;
    let session = state.registry.create(spec)?;
    info!(session_id = %session.id, "session created via http");
    Ok(Json(CreateSessionResponse {
        success: true,
        session_id: session.id.clone(),
        message: "Session created successfully".to_string(),
    }))
}

#[derive(Serialize)]
pub struct SimpleResponse {
    success: bool,
    message: String,
}

/// `DELETE /api/sessions/{id}` — kills the session's child; the actual
/// `exited` transition happens asynchronously once the event loop
/// observes EOF (spec §4.4 `kill`).
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    let session = state.registry.get(&id).ok_or_else(|| AppError::NotFound(id.clone()))?;
    session.kill().await;
    Ok(Json(SimpleResponse { success: true, message: "Session terminated".to_string() }))
}

/// `DELETE /api/sessions/{id}/cleanup` (spec §4.7).
pub async fn cleanup_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    state.registry.cleanup(&id)?;
    Ok(Json(SimpleResponse { success: true, message: "Session cleaned up".to_string() }))
}

/// `POST /api/cleanup-exited` (spec §4.5 `cleanupExited`).
#[derive(Serialize)]
pub struct CleanupExitedResponse {
    success: bool,
    #[serde(rename = "cleanedCount")]
    cleaned_count: usize,
}

pub async fn cleanup_exited(State(state): State<Arc<AppState>>) -> Json<CleanupExitedResponse> {
    let removed = state.registry.cleanup_exited();
    Json(CleanupExitedResponse { success: true, cleaned_count: removed.len() })
}

#[derive(Deserialize)]
pub struct InputRequest {
    text: String,
}

#[derive(Serialize)]
pub struct InputResponse {
    success: bool,
}

/// `POST /api/sessions/{id}/input` (spec §4.7; errors per spec §7
/// StateError: 400 not running, 410 process dead).
pub async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InputRequest>,
) -> Result<Json<InputResponse>, AppError> {
    if body.text.is_empty() {
        return Err(AppError::Client("text must not be empty".to_string()));
    }
    let session = state.registry.get(&id).ok_or_else(|| AppError::NotFound(id.clone()))?;
    session.send_input(&body.text)?;
    Ok(Json(InputResponse { success: true }))
}

/// `GET /api/sessions/{id}/stream` — SSE framing per spec §4.7/§4.6.
pub async fn stream_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = state.registry.get(&id).ok_or_else(|| AppError::NotFound(id.clone()))?;
    let frames = multiplexer::subscribe(session)
        .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;

    let sse_stream = frames.map(|frame| -> Result<SseEvent, Infallible> {
        Ok(match frame {
            Frame::Header(line) => SseEvent::default().data(line),
            Frame::Event(line) => SseEvent::default().data(line),
            Frame::Heartbeat => SseEvent::default().comment("keep-alive"),
        })
    });

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

/// `GET /api/sessions/{id}/snapshot` — raw recording bytes, `text/plain`
/// (spec §4.4 `snapshot`).
pub async fn snapshot_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = state.registry.get(&id).ok_or_else(|| AppError::NotFound(id.clone()))?;
    let bytes = session.snapshot().map_err(crate::error::ResourceError::Storage)?;
    Ok(([("content-type", "text/plain; charset=utf-8")], bytes).into_response())
}

/// `GET /api/sessions/{id}/cast` — self-contained export with `duration`
/// populated, `application/x-asciicast` (spec §4.4 `exportRecording`).
pub async fn cast_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = state.registry.get(&id).ok_or_else(|| AppError::NotFound(id.clone()))?;
    let bytes = session.export_recording().map_err(AppError::Other)?;
    Ok(([("content-type", "application/x-asciicast")], bytes).into_response())
}

#[allow(dead_code)]
fn _assert_stream_is_send<S: Stream<Item = Frame> + Send>(_: S) {}
