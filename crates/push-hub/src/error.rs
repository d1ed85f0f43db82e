use thiserror::Error;

/// Push hub errors
#[derive(Error, Debug)]
pub enum PushError {
    /// A user hit the per-user socket cap
    #[error("connection limit reached for user {user_id} (max {limit})")]
    ConnectionLimit { user_id: i64, limit: usize },

    /// Bearer token missing or rejected by the verifier
    #[error("unauthorized")]
    Unauthorized,

    /// Client sent a sub-channel name outside campaigns|calls|stats
    #[error("unknown subscription channel: {0}")]
    UnknownChannel(String),
}

/// Result type for push hub operations
pub type Result<T> = std::result::Result<T, PushError>;
