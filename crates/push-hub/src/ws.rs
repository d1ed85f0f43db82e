//! axum WebSocket endpoint.
//!
//! Flow:
//! 1. Dashboard connects to `/ws?token=<bearer>`
//! 2. The injected [`TokenVerifier`] resolves the principal
//! 3. The socket joins the user's room (admins also the admin room)
//! 4. Upstream messages: `subscribe`/`unsubscribe`/`ping`

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::PushError;
use crate::events::{ClientMessage, Pong};
use crate::hub::{AuthUser, PushHub, TokenVerifier};

/// Shared state for the ws route
#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<PushHub>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Build a router exposing `GET /ws`
pub fn router(hub: Arc<PushHub>, verifier: Arc<dyn TokenVerifier>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(HubState { hub, verifier })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    let user = match state.verifier.verify(&token) {
        Some(user) => user,
        None => {
            return (axum::http::StatusCode::UNAUTHORIZED, "invalid or missing token")
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, user))
        .into_response()
}

async fn handle_socket(socket: WebSocket, hub: Arc<PushHub>, user: AuthUser) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let mut registered = match hub.register(&user) {
        Ok(r) => r,
        Err(PushError::ConnectionLimit { user_id, limit }) => {
            warn!("Rejecting socket for user {}: limit {} reached", user_id, limit);
            let frame = json!({
                "event": "error",
                "data": {"code": "CONNECTION_LIMIT", "limit": limit},
                "timestamp": Utc::now().to_rfc3339(),
            });
            let _ = ws_sink.send(Message::Text(frame.to_string())).await;
            let _ = ws_sink.close().await;
            return;
        }
        Err(e) => {
            warn!("Socket registration failed for user {}: {}", user.user_id, e);
            return;
        }
    };

    let connection_id = registered.connection_id;
    let user_id = user.user_id;

    // Writer: frames queued by the hub go out on this socket
    let mut frames = std::mem::replace(&mut registered.frames, tokio::sync::mpsc::unbounded_channel().1);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if ws_sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Reader: subscribe / unsubscribe / ping
    while let Some(message) = ws_stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { channel }) => {
                if let Err(e) = registered.subscribe(&channel) {
                    registered.send_direct(
                        json!({
                            "event": "error",
                            "data": {"code": "UNKNOWN_CHANNEL", "message": e.to_string()},
                            "timestamp": Utc::now().to_rfc3339(),
                        })
                        .to_string(),
                    );
                }
            }
            Ok(ClientMessage::Unsubscribe { channel }) => {
                registered.unsubscribe(&channel);
            }
            Ok(ClientMessage::Ping) => {
                let pong = Pong {
                    timestamp: Utc::now().to_rfc3339(),
                };
                registered.send_direct(
                    json!({
                        "event": "pong",
                        "data": pong,
                        "timestamp": Utc::now().to_rfc3339(),
                    })
                    .to_string(),
                );
            }
            Err(_) => {
                debug!("Ignoring malformed client message from user {}", user_id);
            }
        }
    }

    hub.unregister(user_id, connection_id);
    writer.abort();
}
