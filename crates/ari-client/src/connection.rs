//! Event WebSocket pump.
//!
//! Maintains the long-lived control-plane connection to the telephony
//! platform. On close the pump reconnects with a fixed backoff and
//! re-registers the application name (the `app` query parameter);
//! in-flight calls orphaned by an outage are swept by the engine when
//! it observes the synthetic [`AriEvent::Connected`] broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::AriClient;
use crate::events::AriEvent;

/// Fixed reconnect backoff after a closed control channel
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Build the events URL from the REST base URL.
///
/// `http://pbx:8088/ari` becomes
/// `ws://pbx:8088/ari/events?app=...&api_key=user:pass`.
fn events_url(base_url: &str, app: &str, username: &str, password: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    };
    format!(
        "{}/events?app={}&api_key={}:{}&subscribeAll=true",
        ws_base.trim_end_matches('/'),
        app,
        username,
        password
    )
}

pub(crate) fn spawn_event_pump(client: Arc<AriClient>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        run_event_pump(client, shutdown).await;
    });
}

async fn run_event_pump(client: Arc<AriClient>, shutdown: CancellationToken) {
    let config = client.config().clone();
    let url = events_url(
        &config.base_url,
        &config.app_name,
        &config.username,
        &config.password,
    );

    loop {
        if shutdown.is_cancelled() {
            info!("ARI event pump shutting down");
            return;
        }

        let connect = tokio::select! {
            r = connect_async(&url) => r,
            _ = shutdown.cancelled() => {
                info!("ARI event pump shutting down");
                return;
            }
        };

        match connect {
            Ok((stream, _)) => {
                info!("🔌 ARI event stream connected (app={})", config.app_name);
                client.dispatch(AriEvent::Connected);

                let (_, mut read) = stream.split();
                loop {
                    let frame = tokio::select! {
                        f = read.next() => f,
                        _ = shutdown.cancelled() => {
                            info!("ARI event pump shutting down");
                            return;
                        }
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => handle_frame(&client, &text),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("ARI event stream closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("ARI event stream error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("ARI event stream connect failed: {}", e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            _ = shutdown.cancelled() => {
                info!("ARI event pump shutting down");
                return;
            }
        }
    }
}

fn handle_frame(client: &AriClient, text: &str) {
    match serde_json::from_str::<AriEvent>(text) {
        Ok(event) => client.dispatch(event),
        Err(_) => {
            // Frames for event types the engine does not consume
            debug!("Ignoring ARI frame: {}", truncate(text, 120));
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_url_swaps_scheme_and_carries_app() {
        let url = events_url("http://pbx:8088/ari", "outdial", "u", "p");
        assert_eq!(
            url,
            "ws://pbx:8088/ari/events?app=outdial&api_key=u:p&subscribeAll=true"
        );
    }

    #[test]
    fn events_url_handles_tls_and_trailing_slash() {
        let url = events_url("https://pbx/ari/", "app", "u", "p");
        assert!(url.starts_with("wss://pbx/ari/events?"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
