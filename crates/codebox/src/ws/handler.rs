//! WebSocket handler for client connections.

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use codebox_protocol::{ClientCommand, RunEvent};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;

use crate::api::AppState;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Serve one connection: a writer task drains the outbox, this task reads
/// commands in order.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let hub = state.hub.clone();
    let (mut sender, mut receiver) = socket.split();
    let (mut event_rx, conn_id) = hub.register_connection();

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        // The first tick completes immediately.
        ping_interval.tick().await;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(command) => state.sessions.handle_command(conn_id, command).await,
                Err(e) => {
                    warn!("Malformed command from connection {}: {}", conn_id, e);
                    hub.send_to_connection(conn_id, RunEvent::bad_request())
                        .await;
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Binary frame from connection {}, answering 400", conn_id);
                hub.send_to_connection(conn_id, RunEvent::bad_request())
                    .await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Connection {} closed by client", conn_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error on connection {}: {}", conn_id, e);
                break;
            }
        }
    }

    hub.unregister_connection(conn_id);
    send_task.abort();
}
