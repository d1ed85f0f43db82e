//! Integration tests for event decoding and subscription routing,
//! driving the client with injected frames instead of a live platform.

use std::sync::Arc;

use outdial_ari::{AriClient, AriConfig, AriEvent};
use tokio_util::sync::CancellationToken;

fn offline_client() -> Arc<AriClient> {
    let shutdown = CancellationToken::new();
    shutdown.cancel(); // pump exits immediately
    AriClient::connect(
        AriConfig {
            base_url: "http://127.0.0.1:1/ari".to_string(),
            username: "ari".to_string(),
            password: "ari".to_string(),
            app_name: "outdial-test".to_string(),
        },
        shutdown,
    )
    .expect("client")
}

fn event(frame: &str) -> AriEvent {
    serde_json::from_str(frame).expect("valid frame")
}

#[tokio::test]
async fn firehose_receives_every_channel_event() {
    let client = offline_client();
    let mut firehose = client.events();

    client.dispatch(event(
        r#"{"type": "ChannelStateChange", "channel": {"id": "a", "state": "Ringing"}}"#,
    ));
    client.dispatch(event(
        r#"{"type": "ChannelStateChange", "channel": {"id": "b", "state": "Up"}}"#,
    ));

    let first = firehose.recv().await.unwrap();
    let second = firehose.recv().await.unwrap();
    assert_eq!(first.channel_id(), Some("a"));
    assert_eq!(second.channel_id(), Some("b"));
}

#[tokio::test]
async fn channel_subscription_sees_only_its_channel_in_order() {
    let client = offline_client();
    let mut sub = client.subscribe_channel("mine");

    client.dispatch(event(
        r#"{"type": "ChannelDtmfReceived", "digit": "1", "channel": {"id": "other"}}"#,
    ));
    client.dispatch(event(
        r#"{"type": "ChannelStateChange", "channel": {"id": "mine", "state": "Ringing"}}"#,
    ));
    client.dispatch(event(
        r#"{"type": "ChannelDtmfReceived", "digit": "5", "channel": {"id": "mine"}}"#,
    ));
    client.dispatch(event(
        r#"{"type": "ChannelDestroyed", "cause": 16, "channel": {"id": "mine"}}"#,
    ));

    match sub.recv().await.unwrap() {
        AriEvent::ChannelStateChange { channel } => assert_eq!(channel.state, "Ringing"),
        other => panic!("unexpected: {:?}", other),
    }
    match sub.recv().await.unwrap() {
        AriEvent::ChannelDtmfReceived { digit, .. } => assert_eq!(digit, "5"),
        other => panic!("unexpected: {:?}", other),
    }
    match sub.recv().await.unwrap() {
        AriEvent::ChannelDestroyed { cause, .. } => assert_eq!(cause, 16),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn replacing_a_subscription_keeps_the_newest_one_alive() {
    let client = offline_client();

    let old = client.subscribe_channel("ch");
    let mut new = client.subscribe_channel("ch");
    drop(old); // must not unregister the replacement

    client.dispatch(event(
        r#"{"type": "ChannelStateChange", "channel": {"id": "ch", "state": "Up"}}"#,
    ));

    match new.recv().await.unwrap() {
        AriEvent::ChannelStateChange { channel } => assert_eq!(channel.state, "Up"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn playback_events_route_to_the_target_channel() {
    let client = offline_client();
    let mut sub = client.subscribe_channel("ch-42");

    client.dispatch(event(
        r#"{"type": "PlaybackFinished", "playback": {"id": "pb-1", "target_uri": "channel:ch-42"}}"#,
    ));

    match sub.recv().await.unwrap() {
        AriEvent::PlaybackFinished { playback } => {
            assert_eq!(playback.id, "pb-1");
            assert_eq!(playback.channel_id(), Some("ch-42"));
        }
        other => panic!("unexpected: {:?}", other),
    }
}
