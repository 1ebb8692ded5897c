//! Read-only query surface consumed by the dashboard and operator tooling.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Serialize;

use crate::queue::QueueEntry;
use crate::types::PrNumber;

use super::AppState;

/// The queue view: active entries plus recent terminal outcomes.
#[derive(Debug, Serialize)]
pub struct QueueView {
    pub entries: Vec<QueueEntry>,
    pub recent: Vec<QueueEntry>,
}

/// Number of terminal entries included in the queue view.
const RECENT_LIMIT: usize = 50;

/// `GET /api/v1/queue`
pub async fn queue_handler(State(state): State<AppState>) -> Json<QueueView> {
    let queue = state.engine().queue();
    Json(QueueView {
        entries: queue.entries(),
        recent: queue.recent_history(RECENT_LIMIT),
    })
}

/// `DELETE /api/v1/queue/{number}`
pub async fn remove_entry_handler(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Response {
    match state.engine().remove_from_queue(PrNumber(number)).await {
        Ok(true) => (StatusCode::OK, "Removed").into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "No queued entry").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `GET /api/v1/pulls/{number}`
pub async fn pull_request_handler(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Response {
    match state.engine().store().get(PrNumber(number)) {
        Some(pr) => Json(pr).into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown pull request").into_response(),
    }
}

/// `GET /api/v1/pulls/{number}/history`
pub async fn history_handler(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Response {
    Json(state.engine().audit().for_pr(PrNumber(number))).into_response()
}

/// `GET /api/v1/metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    Json(state.engine().queue().metrics(Utc::now())).into_response()
}
