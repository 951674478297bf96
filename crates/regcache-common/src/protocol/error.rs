use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegcacheError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Registry request timeout after {0}ms")]
    Timeout(u64),

    #[error("Registry returned {status}: {message}")]
    Registry { status: u16, message: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid health check: {0}")]
    InvalidHealthCheck(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegcacheError {
    /// Network or registry-side failures that may clear up on the next attempt.
    ///
    /// The snapshot refresher absorbs these and keeps serving the last good
    /// view; register/deregister callers receive them unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            RegcacheError::Transport(_) | RegcacheError::Timeout(_) => true,
            RegcacheError::Registry { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Errors caused by caller input; retrying them is pointless.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegcacheError::Configuration(_)
                | RegcacheError::InvalidAddress(_)
                | RegcacheError::InvalidHealthCheck(_)
        )
    }
}

impl From<url::ParseError> for RegcacheError {
    fn from(err: url::ParseError) -> Self {
        RegcacheError::InvalidAddress(err.to_string())
    }
}

impl From<hyper::http::Error> for RegcacheError {
    fn from(err: hyper::http::Error) -> Self {
        RegcacheError::Transport(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for RegcacheError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        RegcacheError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RegcacheError>;
