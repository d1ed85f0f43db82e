//! # ARI Adapter for the outdial Campaign Engine
//!
//! This crate owns the control-plane connection to the telephony
//! platform (Asterisk REST Interface). It exposes:
//!
//! - Write operations: `Originate`, `Play`, `Hangup`, bridge management,
//!   `Snoop`, and channel variables, as thin authenticated REST calls.
//! - A subscription surface over the persistent event WebSocket:
//!   a broadcast firehose plus per-channel ordered subscriptions.
//!
//! The event pump reconnects with a fixed 3-second backoff on close and
//! re-registers the Stasis application name. Loss of the control channel
//! is not fatal; the pump broadcasts a synthetic [`AriEvent::Connected`]
//! on every (re)connect so the engine can sweep orphaned calls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use outdial_ari::{AriClient, AriConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> outdial_ari::Result<()> {
//! let client = AriClient::connect(
//!     AriConfig {
//!         base_url: "http://pbx:8088/ari".into(),
//!         username: "ari".into(),
//!         password: "secret".into(),
//!         app_name: "outdial".into(),
//!     },
//!     CancellationToken::new(),
//! )?;
//!
//! let mut events = client.events();
//! while let Ok(event) = events.recv().await {
//!     println!("event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod events;

pub use client::{AriClient, AriConfig, ChannelEvents};
pub use error::{AriError, Result};
pub use events::{AriEvent, CallerInfo, ChannelInfo, PlaybackInfo};
