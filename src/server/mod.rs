//! HTTP surface.
//!
//! - `POST /webhook` - accepts webhook deliveries (202 on accepted or
//!   duplicate, 401 on bad signature, 400 on malformed payload)
//! - `GET  /health` - liveness probe
//! - `GET  /api/v1/queue` - current queue contents plus recent outcomes
//! - `DELETE /api/v1/queue/{number}` - manual removal of a queued entry
//! - `GET  /api/v1/pulls/{number}` - current PR snapshot
//! - `GET  /api/v1/pulls/{number}/history` - audit records for one PR
//! - `GET  /api/v1/metrics` - aggregate queue metrics
//! - `GET  /api/v1/events` - server-sent-events stream of notifications

use std::sync::Arc;

use tower_http::trace::TraceLayer;

use crate::engine::Engine;

pub mod api;
pub mod events;
pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

/// Shared application state, passed to all handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Arc<Engine>,
    webhook_secret: Vec<u8>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, webhook_secret: impl Into<Vec<u8>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                engine,
                webhook_secret: webhook_secret.into(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/webhook", post(webhook::webhook_handler))
        .route("/health", get(health::health_handler))
        .route("/api/v1/queue", get(api::queue_handler))
        .route("/api/v1/queue/{number}", delete(api::remove_entry_handler))
        .route("/api/v1/pulls/{number}", get(api::pull_request_handler))
        .route("/api/v1/pulls/{number}/history", get(api::history_handler))
        .route("/api/v1/metrics", get(api::metrics_handler))
        .route("/api/v1/events", get(events::events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
