use super::state::AppState;
use crate::error::{ErrorResponse, SessionError};
use crate::methods::MethodCall;
use crate::session::{SessionSnapshot, StreamStatistics};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `GET /sessions/:texture_id/status`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub texture_id: u64,
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub statistics: StreamStatistics,
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "noSession" => StatusCode::NOT_FOUND,
        "notImplemented" => StatusCode::NOT_IMPLEMENTED,
        "fileExists" | "alreadyActive" | "notActive" | "invalidState" | "disposed" => {
            StatusCode::CONFLICT
        }
        "deviceError" | "IOError" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(error: ErrorResponse) -> Response {
    (status_for(&error.code), Json(error)).into_response()
}

fn no_session(texture_id: u64) -> Response {
    error_response(ErrorResponse::new(
        "noSession",
        format!("No camera with texture id {}", texture_id),
    ))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /methods
/// Dispatch one method call
pub async fn call_method(State(state): State<AppState>, Json(call): Json<MethodCall>) -> Response {
    info!("Method call: {}", call.method);

    match state.methods.handle(call).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /cameras
/// List cameras sessions can open
pub async fn available_cameras(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.cameras())
}

/// GET /sessions/:texture_id/status
/// Snapshot and statistics of one session
pub async fn session_status(
    State(state): State<AppState>,
    Path(texture_id): Path<u64>,
) -> Response {
    let Some(session) = state.registry.get(texture_id).await else {
        return no_session(texture_id);
    };

    let status = async {
        Ok::<_, SessionError>(SessionStatus {
            texture_id,
            snapshot: session.snapshot().await?,
            statistics: session.statistics().await?,
        })
    }
    .await;

    match status {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            error!("Failed to get status of session {}: {}", texture_id, e);
            error_response(e.into())
        }
    }
}

/// GET /sessions/:texture_id/events
/// Stream the session's events until it is disposed
pub async fn session_events(
    State(state): State<AppState>,
    Path(texture_id): Path<u64>,
) -> Response {
    let Some(session) = state.registry.get(texture_id).await else {
        return no_session(texture_id);
    };

    let subscription = match session.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => return error_response(e.into()),
    };

    info!("Streaming events of session {}", texture_id);

    let events = subscription
        .into_stream()
        .map(|event| Event::default().json_data(&event));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
