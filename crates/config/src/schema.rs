//! Config schema types. Every section is `#[serde(default)]` so partial files work.

use std::{fmt, str::FromStr, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use atp_protocol::{DEFAULT_BASE_URL, paths};

/// Root configuration shared by the toolkit and LLM clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtpConfig {
    #[serde(serialize_with = "serialize_secret")]
    pub api_key: Secret<String>,
    /// Application (toolkit) name announced to the backend.
    pub app_name: String,
    pub base_url: String,
    pub protocol: TransportProtocol,
    /// Grace period given to in-flight tool calls on shutdown.
    pub shutdown_grace_ms: u64,
    pub reconnect: ReconnectConfig,
    pub keepalive: KeepaliveConfig,
    pub oauth: OAuthPollConfig,
    pub inbox: InboxConfig,
    pub calls: CallsConfig,
}

impl Default for AtpConfig {
    fn default() -> Self {
        Self {
            api_key: Secret::new(String::new()),
            app_name: String::new(),
            base_url: DEFAULT_BASE_URL.into(),
            protocol: TransportProtocol::default(),
            shutdown_grace_ms: 2_000,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            oauth: OAuthPollConfig::default(),
            inbox: InboxConfig::default(),
            calls: CallsConfig::default(),
        }
    }
}

impl AtpConfig {
    /// Convenience constructor for programmatic use.
    pub fn new(api_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            api_key: Secret::new(api_key.into()),
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Base address without a trailing slash.
    pub fn http_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// WebSocket form of [`Self::base_url`], if the scheme is recognised.
    pub fn ws_base(&self) -> Option<String> {
        paths::ws_base(&self.base_url)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }
}

/// How a client reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Persistent WebSocket channel (push delivery).
    #[default]
    #[serde(alias = "wss")]
    Ws,
    /// Plain request/response HTTP (inbox polling for toolkits).
    #[serde(alias = "https")]
    Http,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ws => write!(f, "ws"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" | "wss" => Ok(Self::Ws),
            "http" | "https" => Ok(Self::Http),
            other => Err(format!(
                "unsupported protocol '{other}', use 'ws', 'wss', 'http', or 'https'"
            )),
        }
    }
}

/// Reconnect backoff bounds for the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay randomised up or down (0.0 disables jitter).
    pub jitter: f64,
    /// Consecutive failed attempts tolerated before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub ping_interval_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: atp_protocol::PING_INTERVAL_SECS,
        }
    }
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Poll cadence for OAuth connection waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthPollConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for OAuthPollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            timeout_secs: 300,
        }
    }
}

impl OAuthPollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub poll_interval_secs: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

impl InboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Timeouts for the LLM client's correlated calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    pub auth_timeout_secs: u64,
    pub context_timeout_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 10,
            context_timeout_secs: 30,
            task_timeout_secs: 120,
        }
    }
}

impl CallsConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.context_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}
