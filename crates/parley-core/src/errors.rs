use serde_json::Value;

use crate::middleware::Chain;

/// Core error type for the bot framework.
///
/// Adapter crates map their specific errors into this type so callers see one
/// contract regardless of where a failure originated.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{chain} middleware error: {message}")]
    Middleware { chain: Chain, message: String },

    /// Network failure, non-2xx status, or a 2xx body carrying an `error` field.
    #[error("transport error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
            body: None,
        }
    }

    /// HTTP status carried by a transport error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
