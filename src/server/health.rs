//! Health check endpoint.

use axum::http::StatusCode;

/// `GET /health` - returns 200 if the server is running.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
