//! Dashboard wire protocol.
//!
//! Frames are JSON objects `{ event, data, timestamp }`; the timestamp
//! is stamped server-side at emission. Canonical event names are kept
//! as constants so emitters and tests agree on spelling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical dashboard event names
pub mod names {
    pub const CALL_INITIATED: &str = "call-initiated";
    pub const CALL_FINISHED: &str = "call-finished";
    pub const AGENTS_STATE_UPDATE: &str = "agents-state-update";
    pub const QUEUE_STATE_UPDATE: &str = "queue-state-update";
    pub const AGENT_CALL_INCOMING: &str = "agent-call-incoming";
    pub const AGENT_CALL_ENDED: &str = "agent-call-ended";
    pub const COMMITMENT_CREATED: &str = "commitment-created";
    pub const AGENT_STATUS_SYNC: &str = "agent-status-sync";
    pub const AGENT_STATUS_FORCED: &str = "agent-status-forced";
}

/// Optional sub-channels a client can opt into on its own room
pub const SUB_CHANNELS: &[&str] = &["campaigns", "calls", "stats"];

/// An event to be fanned out by the hub
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub name: String,
    pub data: Value,
    /// When set, delivered only to sockets subscribed to this
    /// sub-channel; room-wide events leave it unset
    pub channel: Option<String>,
}

impl PushEvent {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data,
            channel: None,
        }
    }

    pub fn on_channel(name: &str, channel: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data,
            channel: Some(channel.to_string()),
        }
    }
}

/// Messages a dashboard client may send upstream
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

/// `pong` reply payload
#[derive(Debug, Serialize)]
pub struct Pong {
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"action": "subscribe", "channel": "calls"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { channel } => assert_eq!(channel, "calls"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_ping() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action": "shout"}"#).is_err());
    }
}
