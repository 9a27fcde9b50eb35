//! Agent WebSocket listener (§4.F): the in-page agent connects here as
//! `ws://127.0.0.1:<agent_ws_port>?authIndex=<i>`. One connection per identity, full duplex
//! JSON frames, lifecycle modeled on the teacher's `gateway::ws::handle_connection` (split
//! socket, dedicated writer task, message loop, cleanup-on-disconnect).

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use relaygate_protocol::ServerFrame;
use relaygate_registry::AgentSocket;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "authIndex")]
    auth_index: u32,
}

/// Router mounted on the dedicated agent port (§12 `agent_ws_port`), separate from the inbound
/// HTTP API's listener.
pub fn agent_router(state: Arc<AppState>) -> Router {
    Router::new().route("/", get(upgrade)).with_state(state)
}

async fn upgrade(
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.auth_index))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, auth_index: u32) {
    info!(auth_index, "agent: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(auth_index, "agent: write loop closed");
                break;
            }
        }
    });

    // `insert` returns `true` only the very first time this identity is seen, when there's
    // nothing stale to clean up; every reconnect after that returns `false` and is the case
    // the Registry's fresh-epoch cleanup actually exists for.
    let fresh_epoch = !state.seen_epochs.insert(auth_index);
    state
        .registry
        .on_socket_open(auth_index, AgentSocket::new(frame_tx.clone()), fresh_epoch)
        .await;
    state.manager.notify_user_activity(auth_index).await;

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(auth_index, error = %err, "agent: read error");
                break;
            }
        };

        let frame: relaygate_protocol::AgentFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(auth_index, error = %err, "agent: invalid frame");
                continue;
            }
        };

        state.registry.on_socket_message(auth_index, frame).await;
    }

    state.registry.on_socket_close(auth_index).await;
    drop(frame_tx);
    writer.abort();
    info!(auth_index, "agent: connection closed");
}
