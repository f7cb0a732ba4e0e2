use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::AppState;
use crate::daemon::events::DaemonEvent;

/// Guard that logs when the subscription stream is dropped (client
/// disconnects). Disconnects are expected, not errors.
struct SubscriberDropGuard;

impl Drop for SubscriberDropGuard {
    fn drop(&mut self) {
        tracing::debug!("Execution subscriber disconnected");
    }
}

/// POST /executions/subscribe
///
/// Long-lived newline-delimited JSON stream: one `Execution` snapshot
/// per line for every `ExecutionUpdated` event published after the
/// subscription was registered. Delivery is best-effort; a subscriber
/// that falls behind the bus capacity misses events. The stream ends on
/// daemon shutdown or client disconnect.
pub async fn subscribe_executions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Execution subscriber connected");

    let rx = state.bus.subscribe();
    let _drop_guard = SubscriberDropGuard;

    let stream = BroadcastStream::new(rx)
        .take_while(|event| !matches!(event, Ok(DaemonEvent::Shutdown)))
        .filter_map(move |event| {
            let _ = &_drop_guard;
            match event {
                Ok(DaemonEvent::ExecutionUpdated { execution }) => {
                    match serde_json::to_string(&execution) {
                        Ok(mut line) => {
                            line.push('\n');
                            Some(Ok::<_, Infallible>(line.into_bytes()))
                        }
                        Err(_) => None,
                    }
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!("Execution subscriber lagged by {} events", n);
                    None
                }
            }
        });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
}
