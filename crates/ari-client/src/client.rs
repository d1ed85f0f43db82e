//! ARI REST surface and event subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AriError, Result};
use crate::events::AriEvent;

/// Capacity of the firehose broadcast channel. Slow subscribers that
/// fall this far behind lose events; per-channel subscriptions are
/// unbounded and do not.
const EVENT_BUS_CAPACITY: usize = 1024;

/// ARI adapter configuration
#[derive(Debug, Clone)]
pub struct AriConfig {
    /// Base URL of the ARI root, e.g. `http://pbx:8088/ari`
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name registered for all channels
    pub app_name: String,
}

/// Handle to a per-channel event subscription.
///
/// Dropping the handle unregisters the subscription, unless a newer
/// subscription for the same channel has replaced it.
pub struct ChannelEvents {
    channel_id: String,
    token: uuid::Uuid,
    rx: mpsc::UnboundedReceiver<AriEvent>,
    subs: Arc<DashMap<String, ChannelSub>>,
}

pub(crate) struct ChannelSub {
    token: uuid::Uuid,
    tx: mpsc::UnboundedSender<AriEvent>,
}

impl ChannelEvents {
    /// Receive the next event observed on this channel.
    ///
    /// Returns `None` once the event pump has shut down.
    pub async fn recv(&mut self) -> Option<AriEvent> {
        self.rx.recv().await
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Drop for ChannelEvents {
    fn drop(&mut self) {
        let token = self.token;
        self.subs
            .remove_if(&self.channel_id, |_, sub| sub.token == token);
    }
}

/// Client for the telephony control plane.
///
/// Owns the HTTP client for ARI writes and the registry of event
/// subscribers fed by the WebSocket pump in [`crate::connection`].
/// All write operations return `Err` on failure; callers log and
/// continue, failures never propagate through the event loop.
pub struct AriClient {
    config: AriConfig,
    http: reqwest::Client,
    pub(crate) events_tx: broadcast::Sender<AriEvent>,
    pub(crate) channel_subs: Arc<DashMap<String, ChannelSub>>,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct VariableResponse {
    value: String,
}

impl AriClient {
    /// Create the client and start the event pump.
    ///
    /// The pump reconnects forever with a fixed backoff until `shutdown`
    /// is cancelled; loss of the control channel is not fatal.
    pub fn connect(config: AriConfig, shutdown: CancellationToken) -> Result<Arc<Self>> {
        if config.base_url.is_empty() {
            return Err(AriError::config("ARI base URL must not be empty"));
        }
        if config.app_name.is_empty() {
            return Err(AriError::config("ARI application name must not be empty"));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(AriError::Transport)?;

        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let client = Arc::new(Self {
            config,
            http,
            events_tx,
            channel_subs: Arc::new(DashMap::new()),
        });

        crate::connection::spawn_event_pump(client.clone(), shutdown);

        Ok(client)
    }

    /// Subscribe to the full event stream
    pub fn events(&self) -> broadcast::Receiver<AriEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to events for a single channel id.
    ///
    /// At most one subscription per channel; a second call replaces the
    /// first. Per-channel handlers run serially with respect to the
    /// channel they observe because delivery is a single ordered queue.
    pub fn subscribe_channel(&self, channel_id: &str) -> ChannelEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = uuid::Uuid::new_v4();
        self.channel_subs
            .insert(channel_id.to_string(), ChannelSub { token, tx });
        ChannelEvents {
            channel_id: channel_id.to_string(),
            token,
            rx,
            subs: self.channel_subs.clone(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub(crate) fn config(&self) -> &AriConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(AriError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Originate an outbound channel.
    ///
    /// `timeout_sec` is the ring timeout enforced by the platform at the
    /// trunk level.
    pub async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        channel_id: &str,
        timeout_sec: u32,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        debug!("📡 Originate {} as channel {}", endpoint, channel_id);
        let body = json!({
            "endpoint": endpoint,
            "app": self.config.app_name,
            "callerId": caller_id,
            "timeout": timeout_sec,
            "channelId": channel_id,
            "variables": variables,
        });
        self.check(self.http.post(self.url("channels")).json(&body))
            .await?;
        Ok(())
    }

    /// Start a playback on a channel; returns the playback id
    pub async fn play(&self, channel_id: &str, media: &str) -> Result<String> {
        let body = json!({ "media": format!("sound:{}", media) });
        let resp = self
            .check(
                self.http
                    .post(self.url(&format!("channels/{}/play", channel_id)))
                    .json(&body),
            )
            .await?;
        let parsed: IdResponse = resp
            .json()
            .await
            .map_err(|e| AriError::decode(format!("playback response: {}", e)))?;
        Ok(parsed.id)
    }

    /// Stop a running playback
    pub async fn stop_playback(&self, playback_id: &str) -> Result<()> {
        self.check(
            self.http
                .delete(self.url(&format!("playbacks/{}", playback_id))),
        )
        .await?;
        Ok(())
    }

    /// Answer a channel that entered Stasis
    pub async fn answer(&self, channel_id: &str) -> Result<()> {
        self.check(
            self.http
                .post(self.url(&format!("channels/{}/answer", channel_id))),
        )
        .await?;
        Ok(())
    }

    /// Hang up a channel. A channel that is already gone is not an error.
    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        let result = self
            .check(self.http.delete(self.url(&format!("channels/{}", channel_id))))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(AriError::Api { status: 404, .. }) => {
                debug!("Channel {} already gone on hangup", channel_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create a mixing bridge; returns the bridge id
    pub async fn create_bridge(&self) -> Result<String> {
        let body = json!({ "type": "mixing" });
        let resp = self
            .check(self.http.post(self.url("bridges")).json(&body))
            .await?;
        let parsed: IdResponse = resp
            .json()
            .await
            .map_err(|e| AriError::decode(format!("bridge response: {}", e)))?;
        Ok(parsed.id)
    }

    /// Add a channel to an existing bridge
    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.check(
            self.http
                .post(self.url(&format!("bridges/{}/addChannel", bridge_id)))
                .query(&[("channel", channel_id)]),
        )
        .await?;
        Ok(())
    }

    /// Destroy a bridge
    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        let result = self
            .check(self.http.delete(self.url(&format!("bridges/{}", bridge_id))))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(AriError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a snoop channel against `channel_id`; returns the snoop
    /// channel id
    pub async fn snoop(&self, channel_id: &str, spy: &str) -> Result<String> {
        let body = json!({ "spy": spy, "app": self.config.app_name });
        let resp = self
            .check(
                self.http
                    .post(self.url(&format!("channels/{}/snoop", channel_id)))
                    .json(&body),
            )
            .await?;
        let parsed: IdResponse = resp
            .json()
            .await
            .map_err(|e| AriError::decode(format!("snoop response: {}", e)))?;
        Ok(parsed.id)
    }

    /// Read a channel variable
    pub async fn get_variable(&self, channel_id: &str, variable: &str) -> Result<String> {
        let resp = self
            .check(
                self.http
                    .get(self.url(&format!("channels/{}/variable", channel_id)))
                    .query(&[("variable", variable)]),
            )
            .await?;
        let parsed: VariableResponse = resp
            .json()
            .await
            .map_err(|e| AriError::decode(format!("variable response: {}", e)))?;
        Ok(parsed.value)
    }

    /// Set a channel variable
    pub async fn set_variable(&self, channel_id: &str, variable: &str, value: &str) -> Result<()> {
        self.check(
            self.http
                .post(self.url(&format!("channels/{}/variable", channel_id)))
                .query(&[("variable", variable), ("value", value)]),
        )
        .await?;
        Ok(())
    }

    /// Deliver one event to the firehose and any channel subscriber.
    ///
    /// Called by the event pump; public so tests can inject scripted
    /// event sequences without a live platform.
    pub fn dispatch(&self, event: AriEvent) {
        if let Some(channel_id) = event.channel_id() {
            if let Some(entry) = self.channel_subs.get(channel_id) {
                if entry.value().tx.send(event.clone()).is_err() {
                    let id = channel_id.to_string();
                    let token = entry.value().token;
                    drop(entry);
                    self.channel_subs.remove_if(&id, |_, sub| sub.token == token);
                }
            }
        }
        // No receivers is fine: broadcast::send errs only when empty
        if self.events_tx.send(event).is_err() {
            debug!("No firehose subscribers for ARI event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AriConfig {
        AriConfig {
            base_url: "http://127.0.0.1:8088/ari".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            app_name: "outdial".to_string(),
        }
    }

    #[tokio::test]
    async fn channel_subscription_routes_and_unregisters() {
        let client = AriClient::connect(test_config(), CancellationToken::new()).unwrap();

        let mut sub = client.subscribe_channel("ch-1");
        let event: AriEvent = serde_json::from_str(
            r#"{"type": "ChannelStateChange", "channel": {"id": "ch-1", "state": "Ringing"}}"#,
        )
        .unwrap();
        client.dispatch(event);

        match sub.recv().await {
            Some(AriEvent::ChannelStateChange { channel }) => {
                assert_eq!(channel.state, "Ringing")
            }
            other => panic!("unexpected: {:?}", other),
        }

        drop(sub);
        assert!(client.channel_subs.get("ch-1").is_none());
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_does_not_panic() {
        let client = AriClient::connect(test_config(), CancellationToken::new()).unwrap();
        client.dispatch(AriEvent::Connected);
    }

    #[test]
    fn rejects_empty_base_url() {
        let mut config = test_config();
        config.base_url = String::new();
        assert!(AriClient::connect(config, CancellationToken::new()).is_err());
    }
}
