//! Typed events delivered over the ARI WebSocket.
//!
//! Event names are preserved literally as Asterisk emits them
//! (`StasisStart`, `ChannelStateChange`, ...). Frames with types the
//! engine does not consume are dropped by the pump at debug level.

use serde::Deserialize;

/// A channel snapshot as embedded in ARI events
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: Option<CallerInfo>,
    /// Channel variables announced with the event, when present
    #[serde(default)]
    pub channelvars: Option<serde_json::Value>,
}

/// Caller id block on a channel snapshot
#[derive(Debug, Clone, Deserialize)]
pub struct CallerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// Playback handle embedded in playback events
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackInfo {
    pub id: String,
    /// `channel:<id>` for channel-targeted playbacks
    #[serde(default)]
    pub target_uri: String,
}

impl PlaybackInfo {
    /// Channel id this playback was targeting, if channel-scoped
    pub fn channel_id(&self) -> Option<&str> {
        self.target_uri.strip_prefix("channel:")
    }
}

/// Events delivered by the ARI event stream
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    /// Channel entered the Stasis application
    StasisStart {
        channel: ChannelInfo,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Channel left the Stasis application
    StasisEnd { channel: ChannelInfo },

    /// Channel state moved (Ringing, Up, ...)
    ChannelStateChange { channel: ChannelInfo },

    /// In-band DTMF digit on a channel
    ChannelDtmfReceived {
        channel: ChannelInfo,
        digit: String,
    },

    /// Channel was torn down; `cause` is the Q.850 code
    ChannelDestroyed {
        channel: ChannelInfo,
        #[serde(default)]
        cause: i32,
        #[serde(default)]
        cause_txt: String,
    },

    /// A playback on a channel ran to completion
    PlaybackFinished { playback: PlaybackInfo },

    /// Synthetic event: the control-plane WebSocket (re)connected.
    /// Never produced by Asterisk; broadcast by the pump so the engine
    /// can sweep orphans after an outage.
    Connected,
}

impl AriEvent {
    /// The channel id this event concerns, when channel-scoped
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AriEvent::StasisStart { channel, .. }
            | AriEvent::StasisEnd { channel }
            | AriEvent::ChannelStateChange { channel }
            | AriEvent::ChannelDtmfReceived { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. } => Some(&channel.id),
            AriEvent::PlaybackFinished { playback } => playback.channel_id(),
            AriEvent::Connected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stasis_start() {
        let frame = r#"{
            "type": "StasisStart",
            "args": ["dialer"],
            "channel": {
                "id": "ch-123",
                "name": "SIP/trunk1-0001",
                "state": "Up",
                "caller": {"name": "", "number": "0999"}
            }
        }"#;
        let event: AriEvent = serde_json::from_str(frame).unwrap();
        match event {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "ch-123");
                assert_eq!(channel.state, "Up");
                assert_eq!(args, vec!["dialer"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn decodes_channel_destroyed_with_cause() {
        let frame = r#"{
            "type": "ChannelDestroyed",
            "cause": 17,
            "cause_txt": "User busy",
            "channel": {"id": "ch-9"}
        }"#;
        let event: AriEvent = serde_json::from_str(frame).unwrap();
        match event {
            AriEvent::ChannelDestroyed { cause, channel, .. } => {
                assert_eq!(cause, 17);
                assert_eq!(channel.id, "ch-9");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn decodes_dtmf_digit() {
        let frame = r#"{
            "type": "ChannelDtmfReceived",
            "digit": "5",
            "duration_ms": 120,
            "channel": {"id": "ch-dtmf"}
        }"#;
        let event: AriEvent = serde_json::from_str(frame).unwrap();
        match event {
            AriEvent::ChannelDtmfReceived { digit, channel } => {
                assert_eq!(digit, "5");
                assert_eq!(channel.id, "ch-dtmf");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn playback_finished_resolves_channel_id() {
        let frame = r#"{
            "type": "PlaybackFinished",
            "playback": {"id": "pb-1", "target_uri": "channel:ch-42"}
        }"#;
        let event: AriEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event.channel_id(), Some("ch-42"));
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let frame = r#"{"type": "BridgeMerged", "bridge": {}}"#;
        assert!(serde_json::from_str::<AriEvent>(frame).is_err());
    }
}
