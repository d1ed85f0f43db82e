//! WebSocket hub state: per-user rooms, the admin room, throttling,
//! and connection lifecycle notifications.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PushError, Result};
use crate::events::{PushEvent, SUB_CHANNELS};
use crate::rate_limit::RateLimiter;
use crate::sanitize::sanitize;

/// Per-user concurrent socket cap; the next connection is rejected
/// with a typed error
pub const MAX_SOCKETS_PER_USER: usize = 5;

/// Authenticated principal attached to a socket
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    /// Admins and supervisors join the shared admin room
    pub admin: bool,
}

/// Pluggable bearer-token verification.
///
/// Real JWT validation lives outside this crate; the hub only needs a
/// way to turn a presented token into a principal.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// Connection lifecycle notifications consumed by the agent dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum HubLifecycle {
    /// First socket for the user came up
    Connected { user_id: i64 },
    /// Last socket for the user went away
    Disconnected { user_id: i64 },
}

struct Connection {
    id: Uuid,
    admin: bool,
    frames: mpsc::UnboundedSender<String>,
    subs: Arc<Mutex<HashSet<String>>>,
}

/// Handle returned to the socket task on successful registration
pub struct RegisteredSocket {
    pub connection_id: Uuid,
    pub frames: mpsc::UnboundedReceiver<String>,
    pub(crate) own_tx: mpsc::UnboundedSender<String>,
    pub(crate) subs: Arc<Mutex<HashSet<String>>>,
}

impl RegisteredSocket {
    /// Subscribe this socket to a sub-channel of its own room
    pub fn subscribe(&self, channel: &str) -> Result<()> {
        if !SUB_CHANNELS.contains(&channel) {
            return Err(PushError::UnknownChannel(channel.to_string()));
        }
        self.subs.lock().insert(channel.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, channel: &str) {
        self.subs.lock().remove(channel);
    }

    /// Push a frame to this socket only (pong, error replies)
    pub fn send_direct(&self, frame: String) {
        let _ = self.own_tx.send(frame);
    }
}

/// The fan-out hub.
///
/// Rooms are keyed by user id; admins additionally receive admin-room
/// multicasts. Emission passes through the sanitizer and the per-key
/// rate limiter; throttled events are dropped silently.
pub struct PushHub {
    connections: DashMap<i64, Vec<Connection>>,
    limiter: RateLimiter,
    lifecycle_tx: mpsc::UnboundedSender<HubLifecycle>,
    lifecycle_rx: Mutex<Option<mpsc::UnboundedReceiver<HubLifecycle>>>,
}

impl PushHub {
    pub fn new() -> Arc<Self> {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            connections: DashMap::new(),
            limiter: RateLimiter::new(),
            lifecycle_tx,
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
        });

        // Periodic GC of idle rate buckets
        let sweeper = Arc::downgrade(&hub);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                match sweeper.upgrade() {
                    Some(hub) => hub.limiter.sweep(),
                    None => return,
                }
            }
        });

        hub
    }

    /// Take the lifecycle stream. Single consumer; returns `None` on a
    /// second call.
    pub fn lifecycle_events(&self) -> Option<mpsc::UnboundedReceiver<HubLifecycle>> {
        self.lifecycle_rx.lock().take()
    }

    /// Register a socket for `user`, enforcing the per-user cap.
    pub fn register(&self, user: &AuthUser) -> Result<RegisteredSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id: Uuid::new_v4(),
            admin: user.admin,
            frames: tx.clone(),
            subs: Arc::new(Mutex::new(HashSet::new())),
        };
        let connection_id = connection.id;
        let subs = connection.subs.clone();

        let mut entry = self.connections.entry(user.user_id).or_default();
        if entry.len() >= MAX_SOCKETS_PER_USER {
            return Err(PushError::ConnectionLimit {
                user_id: user.user_id,
                limit: MAX_SOCKETS_PER_USER,
            });
        }
        let first_socket = entry.is_empty();
        entry.push(connection);
        drop(entry);

        info!("🔗 Socket {} registered for user {}", connection_id, user.user_id);
        if first_socket {
            let _ = self.lifecycle_tx.send(HubLifecycle::Connected {
                user_id: user.user_id,
            });
        }

        Ok(RegisteredSocket {
            connection_id,
            frames: rx,
            own_tx: tx,
            subs,
        })
    }

    /// Remove a socket; emits `Disconnected` when it was the user's last.
    pub fn unregister(&self, user_id: i64, connection_id: Uuid) {
        let mut last_socket = false;
        if let Some(mut entry) = self.connections.get_mut(&user_id) {
            entry.retain(|c| c.id != connection_id);
            last_socket = entry.is_empty();
        }
        if last_socket {
            self.connections.remove(&user_id);
            let _ = self.lifecycle_tx.send(HubLifecycle::Disconnected { user_id });
        }
        debug!("Socket {} unregistered for user {}", connection_id, user_id);
    }

    /// Whether the user currently holds at least one socket
    pub fn is_connected(&self, user_id: i64) -> bool {
        self.connections
            .get(&user_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    /// Emit to one user's room
    pub fn emit_to_user(&self, user_id: i64, event: PushEvent) {
        if !self.limiter.allow(&user_id.to_string()) {
            return;
        }
        let frame = render(&event);
        if let Some(entry) = self.connections.get(&user_id) {
            for connection in entry.iter() {
                deliver(connection, &event, &frame);
            }
        }
    }

    /// Multicast to every admin socket
    pub fn emit_to_admins(&self, event: PushEvent) {
        if !self.limiter.allow("admin_broadcast") {
            return;
        }
        let frame = render(&event);
        for entry in self.connections.iter() {
            for connection in entry.iter().filter(|c| c.admin) {
                deliver(connection, &event, &frame);
            }
        }
    }

}

fn deliver(connection: &Connection, event: &PushEvent, frame: &str) {
    if let Some(channel) = &event.channel {
        if !connection.subs.lock().contains(channel) {
            return;
        }
    }
    if connection.frames.send(frame.to_string()).is_err() {
        warn!("Dropping frame for closed socket {}", connection.id);
    }
}

/// Serialize an event with the server-side timestamp stamp
fn render(event: &PushEvent) -> String {
    let mut data = event.data.clone();
    sanitize(&mut data);
    json!({
        "event": event.name,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::names;

    fn user(id: i64) -> AuthUser {
        AuthUser {
            user_id: id,
            admin: false,
        }
    }

    fn admin(id: i64) -> AuthUser {
        AuthUser {
            user_id: id,
            admin: true,
        }
    }

    #[tokio::test]
    async fn sixth_socket_is_rejected() {
        let hub = PushHub::new();
        let mut sockets = Vec::new();
        for _ in 0..MAX_SOCKETS_PER_USER {
            sockets.push(hub.register(&user(1)).unwrap());
        }
        match hub.register(&user(1)) {
            Err(PushError::ConnectionLimit { user_id, limit }) => {
                assert_eq!(user_id, 1);
                assert_eq!(limit, MAX_SOCKETS_PER_USER);
            }
            other => panic!("expected connection limit, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn lifecycle_fires_on_first_and_last_socket() {
        let hub = PushHub::new();
        let mut lifecycle = hub.lifecycle_events().unwrap();

        let socket_a = hub.register(&user(9)).unwrap();
        let socket_b = hub.register(&user(9)).unwrap();
        assert_eq!(
            lifecycle.recv().await,
            Some(HubLifecycle::Connected { user_id: 9 })
        );

        hub.unregister(9, socket_a.connection_id);
        assert!(lifecycle.try_recv().is_err());

        hub.unregister(9, socket_b.connection_id);
        assert_eq!(
            lifecycle.recv().await,
            Some(HubLifecycle::Disconnected { user_id: 9 })
        );
        assert!(!hub.is_connected(9));
    }

    #[tokio::test]
    async fn user_room_delivery_and_sanitization() {
        let hub = PushHub::new();
        let mut socket = hub.register(&user(3)).unwrap();

        hub.emit_to_user(
            3,
            PushEvent::new(
                names::CALL_INITIATED,
                json!({"contactId": 5, "token": "leak"}),
            ),
        );

        let frame = socket.frames.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "call-initiated");
        assert_eq!(parsed["data"]["contactId"], 5);
        assert!(parsed["data"].get("token").is_none());
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn admin_multicast_skips_plain_users() {
        let hub = PushHub::new();
        let mut admin_socket = hub.register(&admin(1)).unwrap();
        let mut user_socket = hub.register(&user(2)).unwrap();

        hub.emit_to_admins(PushEvent::new(names::COMMITMENT_CREATED, json!({"day": 15})));

        assert!(admin_socket.frames.recv().await.is_some());
        assert!(user_socket.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_scoped_events_need_subscription() {
        let hub = PushHub::new();
        let mut socket = hub.register(&user(4)).unwrap();

        hub.emit_to_user(
            4,
            PushEvent::on_channel(names::AGENTS_STATE_UPDATE, "stats", json!({})),
        );
        assert!(socket.frames.try_recv().is_err());

        socket.subscribe("stats").unwrap();
        hub.emit_to_user(
            4,
            PushEvent::on_channel(names::AGENTS_STATE_UPDATE, "stats", json!({})),
        );
        assert!(socket.frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_sub_channel_is_a_typed_error() {
        let hub = PushHub::new();
        let socket = hub.register(&user(5)).unwrap();
        assert!(matches!(
            socket.subscribe("billing"),
            Err(PushError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn throttled_events_are_dropped() {
        let hub = PushHub::new();
        let mut socket = hub.register(&user(6)).unwrap();

        for _ in 0..crate::rate_limit::MAX_EVENTS + 5 {
            hub.emit_to_user(6, PushEvent::new(names::CALL_FINISHED, json!({})));
        }

        let mut received = 0;
        while socket.frames.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, crate::rate_limit::MAX_EVENTS as usize);
    }
}
