// =============================================================================
// Observer WebSocket — notice and trade-update push feed
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive a tagged JSON message for every
// client notice and every committed trade mutation:
//
//   {"type": "notice", "notice": {...}}
//   {"type": "trade",  "trade":  {...}}
//
// The handler responds to Ping frames with Pong frames and cleans up on
// disconnect. A slow client sees drop-oldest semantics from the underlying
// broadcast channels; missed trade updates are recoverable via the REST
// query endpoints.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::rest::ApiState;
use crate::notice::ClientNotice;
use crate::trade::model::Trade;

// =============================================================================
// Outbound messages
// =============================================================================

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    Notice { notice: ClientNotice },
    Trade { trade: Trade },
}

// =============================================================================
// Handlers
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    info!("observer WebSocket connection accepted - upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manage a single observer connection until it disconnects.
async fn handle_ws_connection(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();

    let mut notices = state.notices.subscribe();
    let mut trades = state.service.subscribe_updates();

    loop {
        tokio::select! {
            notice = notices.recv() => {
                match notice {
                    Ok(notice) => {
                        if send_feed(&mut sender, &FeedMessage::Notice { notice }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "observer notice feed lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            trade = trades.recv() => {
                match trade {
                    Ok(trade) => {
                        if send_feed(&mut sender, &FeedMessage::Trade { trade }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "observer trade feed lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("observer WebSocket disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong from observers carry no meaning.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "observer WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    debug!("observer WebSocket cleanup complete");
}

/// Serialize and send one feed message.
async fn send_feed<S>(sender: &mut S, message: &FeedMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.map_err(|e| {
            debug!(error = %e, "observer WebSocket send failed");
        }),
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "failed to serialize feed message");
            Ok(())
        }
    }
}
