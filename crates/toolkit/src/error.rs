use atp_common::FromMessage;

/// Errors raised while registering, dispatching or serving tools.
///
/// The `Display` strings of the dispatch variants are what the backend
/// receives in an error result, so they are part of the wire contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid tool descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("Tool not found")]
    ToolNotFound { name: String },

    #[error("Missing required parameter: {name}")]
    MissingParameter { name: String },

    #[error("Missing authentication token")]
    AuthTokenUnavailable { provider: String },

    #[error("{message}")]
    HandlerFailure { message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("giving up after {attempts} failed connection attempts")]
    ConnectivityExhausted { attempts: u32 },

    #[error("client already started")]
    AlreadyStarted,

    #[error("an API key is required to start the client")]
    MissingApiKey,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

atp_common::impl_context!();
