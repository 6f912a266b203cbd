//! Semantic checks on a loaded [`AtpConfig`].

use std::fmt;

use crate::schema::{AtpConfig, TransportProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "reconnect.max_delay_ms".
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &AtpConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !config.has_api_key() {
        result.push(Severity::Error, "api_key", "API key is empty");
    }
    if config.app_name.trim().is_empty() {
        result.push(
            Severity::Warning,
            "app_name",
            "app name is empty, toolkit announcements will be anonymous",
        );
    }

    match url::Url::parse(&config.base_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {},
        Ok(url) => result.push(
            Severity::Error,
            "base_url",
            format!("unsupported scheme '{}', expected http or https", url.scheme()),
        ),
        Err(e) => result.push(Severity::Error, "base_url", format!("invalid URL: {e}")),
    }

    let reconnect = &config.reconnect;
    if reconnect.initial_delay_ms == 0 {
        result.push(
            Severity::Warning,
            "reconnect.initial_delay_ms",
            "zero delay reconnects in a tight loop",
        );
    }
    if reconnect.max_delay_ms < reconnect.initial_delay_ms {
        result.push(
            Severity::Error,
            "reconnect.max_delay_ms",
            "must be at least reconnect.initial_delay_ms",
        );
    }
    if !(reconnect.multiplier.is_finite() && reconnect.multiplier >= 1.0) {
        result.push(Severity::Error, "reconnect.multiplier", "must be a finite number >= 1.0");
    }
    if !(0.0..=1.0).contains(&reconnect.jitter) {
        result.push(Severity::Error, "reconnect.jitter", "must be within 0.0..=1.0");
    }

    if config.oauth.poll_interval_ms == 0 {
        result.push(Severity::Error, "oauth.poll_interval_ms", "must be positive");
    }
    if config.protocol == TransportProtocol::Http && config.inbox.poll_interval_secs == 0 {
        result.push(Severity::Error, "inbox.poll_interval_secs", "must be positive");
    }
    if config.keepalive.ping_interval_secs == 0 {
        result.push(
            Severity::Warning,
            "keepalive.ping_interval_secs",
            "keepalive pings disabled",
        );
    }

    result
}
