//! Read-only HTTP surface for external dashboards.
//!
//! All non-SSE responses are JSON; CORS is permissive by design since the
//! consumers are local dashboards. `/api/events` streams hook events as
//! server-sent events with optional `?events=a,b` kind filtering and
//! periodic heartbeat frames.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::backend::TaskBackend;

use super::Observer;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServerState {
    pub observer: Observer,
    pub backend: Arc<dyn TaskBackend>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks/current", get(current_task))
        .route("/api/tasks/next", get(next_task))
        .route("/api/tasks/pending", get(pending_tasks))
        .route("/api/tasks/completed", get(completed_tasks))
        .route("/api/tasks/stats", get(stats))
        .route("/api/events", get(sse_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the cancellation token fires.
pub async fn run_server(
    state: ServerState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("drover serve shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn current_task(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.observer.snapshot().current_task)
}

async fn next_task(
    State(state): State<ServerState>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .backend
        .find_next_task()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(task).into_response())
}

async fn pending_tasks(
    State(state): State<ServerState>,
) -> Result<axum::response::Response, AppError> {
    let tasks = state
        .backend
        .list_pending_tasks()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

async fn completed_tasks(
    State(state): State<ServerState>,
) -> Result<axum::response::Response, AppError> {
    let tasks = state
        .backend
        .list_completed_tasks()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

async fn stats(State(state): State<ServerState>) -> Result<axum::response::Response, AppError> {
    let snapshot = state.observer.snapshot();
    let pending = state
        .backend
        .list_pending_tasks()
        .await
        .map_err(AppError::internal)?
        .len();
    let failed_backlog = state
        .backend
        .list_failed_tasks()
        .await
        .map_err(AppError::internal)?
        .len();

    Ok(Json(serde_json::json!({
        "loop": snapshot,
        "backlog": {
            "pending": pending,
            "failed": failed_backlog,
        },
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated event kinds, e.g. `task_start,cli_result`.
    events: Option<String>,
}

async fn sse_events(
    State(state): State<ServerState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter: Option<HashSet<String>> = query.events.map(|raw| {
        raw.split(',')
            .map(|kind| kind.trim().to_string())
            .filter(|kind| !kind.is_empty())
            .collect()
    });

    let rx = state.observer.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let frame = match item {
            Ok(frame) => frame,
            // Lagged receiver: skip the gap, keep streaming.
            Err(_) => return None,
        };
        if let Some(filter) = &filter {
            if !filter.contains(&frame.kind) {
                return None;
            }
        }
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Some(Ok(Event::default().event(frame.kind.clone()).data(data)))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
