use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use callbox_proto::RelayEnvelope;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handlers::RelayState;
use crate::registry::RelayConnection;
use crate::router::ConnectionContext;

/// Entry point shared by `/` and `/api`: upgrades WebSocket requests and
/// answers plain GETs with the health document.
pub async fn relay_entry(
    ws: Option<WebSocketUpgrade>,
    State(state): State<RelayState>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        None => Json(state.health()).into_response(),
    }
}

/// Drives one relay connection until the peer goes away.
///
/// Frames from a single socket are handled strictly in order by this task;
/// only the registry is shared with other sockets.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEnvelope>();
    let mut context = ConnectionContext::new(RelayConnection::new(tx));
    let connection_id = context.id();

    counter!("callbox_relay_connections_opened_total", 1);
    info!(connection_id = %connection_id, "relay connection opened");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to encode relay envelope");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(err) = state.router.route_text(&mut context, &text) {
            warn!(connection_id = %connection_id, error = %err, "ignoring malformed envelope");
            counter!("callbox_relay_malformed_frames_total", 1);
        }
    }

    state.router.disconnect(&context);
    writer.abort();

    counter!("callbox_relay_connections_closed_total", 1);
    info!(
        connection_id = %connection_id,
        identity = ?context.identity(),
        "relay connection closed"
    );
}
