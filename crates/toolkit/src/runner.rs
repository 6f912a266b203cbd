use std::fmt;

use {async_trait::async_trait, tokio::sync::watch};

use crate::error::Result;

/// Lifecycle of a toolkit client's link to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Transport that serves the registry to the backend: the WebSocket
/// [`ConnectionManager`](crate::connection::ConnectionManager) or the HTTP
/// [`InboxPoller`](crate::inbox::InboxPoller).
#[async_trait]
pub trait ToolkitRunner: Send + Sync {
    /// Spawn the background task. Fails with `AlreadyStarted` on a second call.
    fn start(&self) -> Result<()>;

    /// Cancel the background task and wait for it to settle. Idempotent.
    async fn stop(&self);

    /// Wait for the background task to end. Returns the fatal error, if any.
    async fn wait(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn subscribe(&self) -> watch::Receiver<ConnectionState>;

    /// Announce the registry again, e.g. after a tool was added at runtime.
    fn refresh_tools(&self);
}
