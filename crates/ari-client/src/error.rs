use thiserror::Error;

/// Errors surfaced by the ARI adapter
#[derive(Error, Debug)]
pub enum AriError {
    /// HTTP transport failure talking to the ARI REST surface
    #[error("ARI transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// ARI returned a non-success status
    #[error("ARI request failed: {status} {body}")]
    Api { status: u16, body: String },

    /// The event WebSocket is not connected
    #[error("ARI event stream disconnected")]
    Disconnected,

    /// Malformed event frame or response payload
    #[error("ARI decode error: {0}")]
    Decode(String),

    /// Invalid adapter configuration
    #[error("ARI configuration error: {0}")]
    Config(String),
}

impl AriError {
    /// Create a new Decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type for ARI adapter operations
pub type Result<T> = std::result::Result<T, AriError>;
