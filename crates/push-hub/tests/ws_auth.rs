//! End-to-end tests for the dashboard socket: a real listener, a real
//! WebSocket client, and the authentication gate in between.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use outdial_push::{names, router, AuthUser, PushEvent, PushHub, TokenVerifier};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

struct FixedVerifier;

impl TokenVerifier for FixedVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        match token {
            "agent" => Some(AuthUser {
                user_id: 7,
                admin: false,
            }),
            "boss" => Some(AuthUser {
                user_id: 1,
                admin: true,
            }),
            _ => None,
        }
    }
}

/// Bind an ephemeral port and serve the hub router on it
async fn serve_hub() -> (Arc<PushHub>, String) {
    let hub = PushHub::new();
    let app = router(hub.clone(), Arc::new(FixedVerifier));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hub, format!("ws://{}/ws", addr))
}

#[tokio::test]
async fn handshake_without_token_is_rejected() {
    let (_hub, url) = serve_hub().await;

    match connect_async(&url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Ok(_) => panic!("handshake should have been rejected"),
        Err(other) => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn handshake_with_bad_token_is_rejected() {
    let (_hub, url) = serve_hub().await;

    match connect_async(format!("{}?token=nope", url)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        Ok(_) => panic!("handshake should have been rejected"),
        Err(other) => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn authenticated_socket_receives_room_events_and_pong() {
    let (hub, url) = serve_hub().await;

    let (mut socket, _) = connect_async(format!("{}?token=agent", url))
        .await
        .expect("handshake");

    // Give the hub a beat to register the connection
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(hub.is_connected(7));

    hub.emit_to_user(
        7,
        PushEvent::new(names::CALL_INITIATED, json!({"contactId": 3})),
    );
    let frame = socket.next().await.unwrap().unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(parsed["event"], "call-initiated");
    assert_eq!(parsed["data"]["contactId"], 3);

    // ping -> pong with a server timestamp
    socket
        .send(Message::Text(r#"{"action": "ping"}"#.to_string()))
        .await
        .unwrap();
    let frame = socket.next().await.unwrap().unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(parsed["event"], "pong");
    assert!(parsed["data"]["timestamp"].is_string());

    // Closing the socket eventually empties the user's room
    socket.close(None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!hub.is_connected(7));
}

#[tokio::test]
async fn admin_socket_receives_admin_room_multicast() {
    let (hub, url) = serve_hub().await;

    let (mut admin_socket, _) = connect_async(format!("{}?token=boss", url))
        .await
        .expect("handshake");
    let (mut agent_socket, _) = connect_async(format!("{}?token=agent", url))
        .await
        .expect("handshake");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    hub.emit_to_admins(PushEvent::new(names::COMMITMENT_CREATED, json!({"day": 15})));

    let frame = admin_socket.next().await.unwrap().unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(parsed["event"], "commitment-created");

    // The plain agent saw nothing
    let nothing = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        agent_socket.next(),
    )
    .await;
    assert!(nothing.is_err());
}
