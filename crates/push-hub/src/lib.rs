//! # Push Fan-out Hub
//!
//! WebSocket hub for the live operations dashboard. Sockets are keyed
//! by user id; supervisors and admins additionally receive admin-room
//! multicasts. The hub enforces:
//!
//! - Per-socket bearer-token authentication through an injected
//!   [`TokenVerifier`]
//! - A cap of [`MAX_SOCKETS_PER_USER`] concurrent sockets per user
//! - Token-bucket throttling per emission key (user id or
//!   `admin_broadcast`); throttled events are dropped
//! - A payload sanitizer stripping credential fields
//! - A server-side timestamp on every frame
//!
//! Clients may opt into `campaigns|calls|stats` sub-channels scoped to
//! their own room, and `ping` is answered with `pong { timestamp }`.

pub mod error;
pub mod events;
pub mod hub;
pub mod rate_limit;
pub mod sanitize;
pub mod ws;

pub use error::{PushError, Result};
pub use events::{names, ClientMessage, PushEvent};
pub use hub::{AuthUser, HubLifecycle, PushHub, TokenVerifier, MAX_SOCKETS_PER_USER};
pub use ws::{router, HubState};
