use thiserror::Error;

/// Campaign engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Telephony control-plane errors
    #[error("Telephony error: {0}")]
    Ari(#[from] outdial_ari::AriError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors (listener binding, shutdown)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-tenant channel budget would be exceeded
    #[error("Channel budget exceeded: requested {requested}, used {used} of {max}")]
    BudgetExceeded {
        max: i32,
        used: i32,
        requested: i32,
    },

    /// Text-to-speech synthesis failure
    #[error("TTS error: {0}")]
    Tts(String),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Call executor errors
    #[error("Executor error: {0}")]
    Executor(String),

    /// Post-call IVR errors
    #[error("IVR error: {0}")]
    Ivr(String),

    /// Agent dispatcher errors
    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Create a new Tts error
    pub fn tts<S: Into<String>>(msg: S) -> Self {
        Self::Tts(msg.into())
    }

    /// Create a new Scheduler error
    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create a new Executor error
    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Self::Executor(msg.into())
    }

    /// Create a new Ivr error
    pub fn ivr<S: Into<String>>(msg: S) -> Self {
        Self::Ivr(msg.into())
    }

    /// Create a new Dispatcher error
    pub fn dispatcher<S: Into<String>>(msg: S) -> Self {
        Self::Dispatcher(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new InvalidInput error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
