use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while gating work
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unexpected script reply: {0}")]
    ScriptReply(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Construction failed in a concurrent call this one waited on
    #[error("Limiter initialization failed: {0}")]
    Init(String),
}

impl RateLimitError {
    /// True when the caller asked for the wait to be abandoned.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RateLimitError::Cancelled)
    }

    /// True when the store no longer knows the cached script digest
    /// (typically after a restart or `SCRIPT FLUSH`).
    pub fn is_stale_script(&self) -> bool {
        match self {
            RateLimitError::Redis(e) => e.kind() == redis::ErrorKind::NoScriptError,
            _ => false,
        }
    }

    /// Server-reported failures are worth another evaluation attempt,
    /// broken connections are not.
    pub fn is_retryable_store_error(&self) -> bool {
        match self {
            RateLimitError::Redis(e) => !e.is_io_error() && !e.is_connection_dropped(),
            _ => false,
        }
    }
}
