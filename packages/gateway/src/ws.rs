//! WebSocket chat transport.
//!
//! Unlike the SSE path, text envelopes here go through the sentence buffer
//! so the rendered chat bubble updates in whole sentences. One socket can
//! carry many sessions; dropping the socket cancels all of them.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::{build_engine_request, random_suffix, AppState, ChatRequest};
use crate::session::run_session;
use crate::translator::{error_envelope, Envelope};

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    session_id: Option<String>,
    request: Option<ChatRequest>,
}

pub async fn ws_chat(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, client_id))
}

async fn handle_chat_socket(socket: WebSocket, state: Arc<AppState>, client_id: String) {
    info!(client_id = %client_id, "websocket connected");
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(32);

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_frame(&state, &client_id, &text, &out_tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(client_id = %client_id, "ignoring binary frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    state.registry.cancel_all_for_connection(&client_id).await;
    info!(client_id = %client_id, "websocket disconnected");

    // Sessions hold the remaining sender clones; once they wind down the
    // channel closes and the writer task exits.
    drop(out_tx);
    let _ = send_task.await;
}

async fn handle_client_frame(
    state: &Arc<AppState>,
    client_id: &str,
    text: &str,
    out_tx: &mpsc::Sender<Envelope>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(client_id = %client_id, error = %err, "malformed client frame");
            let _ = out_tx
                .send(error_envelope(client_id, "invalid frame"))
                .await;
            return;
        }
    };

    match frame.action.as_str() {
        "chat" => {
            let session_id = frame
                .session_id
                .unwrap_or_else(|| format!("{client_id}_{}", random_suffix()));
            let Some(request) = frame.request else {
                let _ = out_tx
                    .send(error_envelope(&session_id, "chat frame is missing a request"))
                    .await;
                return;
            };

            let settings = state.settings.read().await.clone();
            let engine_request = build_engine_request(&settings, &request);
            tokio::spawn(run_session(
                state.registry.clone(),
                state.engine.clone(),
                engine_request,
                session_id,
                client_id.to_string(),
                true,
                out_tx.clone(),
            ));
        }
        other => {
            warn!(client_id = %client_id, action = %other, "unknown websocket action");
            let session_id = frame.session_id.unwrap_or_else(|| client_id.to_string());
            let _ = out_tx
                .send(error_envelope(
                    &session_id,
                    &format!("unknown action: {other}"),
                ))
                .await;
        }
    }
}
