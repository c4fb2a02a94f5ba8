//! Server-Sent Events stream of watcher events
//!
//! One-directional fan-out of slot transitions to live observers. Each
//! connection gets its own bounded broadcast receiver: a slow client drops
//! its own backlog (at-most-once delivery) and never blocks the state
//! machine or other observers. Reconnecting observers receive no replay —
//! they re-derive current state from `GET /subjects/{id}`.

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// GET /events - live watcher event stream
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("new SSE observer connected");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        // Connection status marker so the UI can flip to "live" immediately
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            tokio::select! {
                // Heartbeat every 15 seconds keeps idle proxies from
                // dropping the connection
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    debug!("SSE: sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => {
                    match received {
                        Ok(event) => {
                            match serde_json::to_string(&event) {
                                Ok(json) => {
                                    yield Ok(Event::default()
                                        .event("WatcherEvent")
                                        .data(json));
                                }
                                Err(e) => {
                                    warn!("SSE: failed to serialize event: {e}");
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // This observer fell behind; its dropped backlog
                            // is recoverable via the status endpoints.
                            warn!("SSE: observer lagged, {skipped} events dropped");
                        }
                        Err(RecvError::Closed) => {
                            info!("SSE: event bus closed, ending stream");
                            break;
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
