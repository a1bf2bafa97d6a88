// =============================================================================
// WebSocket Handler — push-based MarketEvent forwarding
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive every MarketEvent
// published to the shared broadcast channel, as a JSON text frame, for as
// long as the connection stays open. A client that falls behind the
// channel's capacity observes dropped frames (via `RecvError::Lagged`)
// rather than ever stalling the publishing side; the drop count is folded
// into the connection's own frames_dropped tally and logged, not fatal.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::events::MarketEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request. Validates the token from
/// the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state)).into_response()
}

/// Forwards `MarketEvent`s from the shared broadcast channel to one
/// connected client, concurrently draining client-sent Ping/Pong/Close
/// frames via `tokio::select!`.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();
    let frames_dropped = AtomicU64::new(0);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send_event(&mut sender, &event).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        frames_dropped.fetch_add(n, Ordering::Relaxed);
                        debug!(dropped = n, "WebSocket subscriber lagged, frames dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("event channel closed — disconnecting");
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    let dropped = frames_dropped.load(Ordering::Relaxed);
    if dropped > 0 {
        info!(dropped, "WebSocket connection closed with dropped frames");
    } else {
        info!("WebSocket connection closed");
    }
}

async fn send_event<S>(sender: &mut S, event: &MarketEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize market event");
            Ok(())
        }
    }
}
