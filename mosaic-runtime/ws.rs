//! Ambient WS entry point: the minimal surface needed to exercise
//! `submitSendMessage`/`submitInterruptSession` and the user-facing
//! fan-out channel (§6).

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::runtime_manager::RuntimeManager;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

/// Client -> server shapes accepted on the socket (§6).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    UserMessage { session_id: String, message: String },
    UserInterrupt { session_id: String },
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (connection_id, mut rx) = state.runtime.user_broker().connect_user(&user_id).await;

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "ws: unparseable client frame, dropping");
                continue;
            }
        };
        match frame {
            ClientFrame::UserMessage { session_id, message } => {
                if let Err(e) = state.runtime.submit_send_message(&session_id, message).await {
                    warn!(error = %e, session_id = %session_id, "submit_send_message failed");
                }
            }
            ClientFrame::UserInterrupt { session_id } => {
                if let Err(e) = state.runtime.submit_interrupt_session(&session_id).await {
                    warn!(error = %e, session_id = %session_id, "submit_interrupt_session failed");
                }
            }
        }
    }

    forward.abort();
    state.runtime.user_broker().disconnect_user(&user_id, connection_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_message_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"user_message","session_id":"s1","message":"hi"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::UserMessage { .. }));
    }

    #[test]
    fn parses_user_interrupt_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"user_interrupt","session_id":"s1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::UserInterrupt { .. }));
    }
}
