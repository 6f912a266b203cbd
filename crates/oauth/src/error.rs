use atp_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("platform not found: {platform_id}")]
    PlatformNotFound { platform_id: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("timed out waiting for {platform_id} authorization")]
    OAuthTimeout { platform_id: String },

    #[error("no tokens available for {platform_id}/{external_user_id}")]
    TokensUnavailable {
        platform_id: String,
        external_user_id: String,
    },

    #[error("backend reported {platform_id} connected without an integration id")]
    MissingIntegration { platform_id: String },

    #[error("wait cancelled")]
    Cancelled,

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
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

atp_common::impl_context!();
