//! Webhook endpoint handler.
//!
//! Verifies the delivery signature over the exact raw body bytes before any
//! parsing, then hands the delivery to the engine. The response is 2xx for
//! "accepted or duplicate", 401 for a signature failure, and 4xx for a
//! malformed payload.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::classifier::Delivery;
use crate::engine::{DeliveryOutcome, EngineError};
use crate::types::DeliveryId;
use crate::webhooks::verify_signature;

use super::AppState;

/// Header name for the event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for the delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for the signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that can occur when processing a webhook request.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Engine(EngineError::Malformed(_)) => StatusCode::BAD_REQUEST,
            // Not acknowledged: the sender redelivers, and idempotency by
            // delivery ID makes that safe.
            WebhookError::Engine(EngineError::Persistence(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Accepts webhook deliveries.
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let delivery_id = DeliveryId::new(get_header(&headers, HEADER_DELIVERY)?);
    let signature_header = get_header(&headers, HEADER_SIGNATURE)?;

    debug!(delivery_id = %delivery_id, event_type = %event_type, "received webhook");

    // Verify before any parsing or I/O.
    if !verify_signature(&body, &signature_header, app_state.webhook_secret()) {
        warn!(delivery_id = %delivery_id, "invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let delivery = Delivery::new(delivery_id, event_type, body.to_vec());
    let outcome = app_state.engine().handle_delivery(delivery).await?;

    Ok(match outcome {
        DeliveryOutcome::Processed { .. } => (StatusCode::ACCEPTED, "Accepted"),
        DeliveryOutcome::Duplicate => (StatusCode::ACCEPTED, "Accepted (duplicate)"),
        DeliveryOutcome::Ignored => (StatusCode::ACCEPTED, "Accepted (ignored)"),
    })
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}
