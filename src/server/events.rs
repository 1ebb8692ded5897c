//! Server-sent-events stream of notifications.
//!
//! Each subscriber gets every notification published after it connects. A
//! subscriber that falls behind loses the oldest buffered messages; the
//! stream simply continues with the newest, and the client reconciles by
//! fetching fresh snapshots from the query API.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::AppState;

/// `GET /api/v1/events`
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.engine().notifier().subscribe();
    debug!("sse subscriber connected");

    let stream = BroadcastStream::new(rx).filter_map(|message| match message {
        Ok(notification) => Event::default()
            .event(notification.event.clone())
            .json_data(&notification)
            .ok()
            .map(Ok),
        // Lagged: drop the error, keep streaming the newest messages.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
