use std::time::{SystemTime, UNIX_EPOCH};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use atp_protocol::{OAuthStatus, OAuthTokenResponse};

/// Access/refresh token pair for one (platform, external user).
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<Secret<String>>,
    /// Unix timestamp when the access token expires.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token.into()));
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Build from a token endpoint response. `None` when no access token was issued.
    pub fn from_response(resp: OAuthTokenResponse) -> Option<Self> {
        let access = resp.access_token.filter(|t| !t.is_empty())?;
        Some(Self {
            access_token: Secret::new(access),
            refresh_token: resp.refresh_token.map(Secret::new),
            expires_at: resp.expires_in.map(|secs| unix_now() + secs),
        })
    }

    /// True once `expires_at` has passed. Tokens without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= unix_now())
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One in-progress authorization, tracked from initiation until tokens are
/// retrieved or the wait times out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSession {
    pub platform_id: String,
    pub external_user_id: String,
    pub authorization_url: String,
    pub integration_id: Option<String>,
    pub status: OAuthStatus,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

/// Serialize a `Secret<String>` by exposing its inner value.
pub fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Serialize an `Option<Secret<String>>` by exposing its inner value.
pub fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_tokens() {
        let pair = TokenPair::new("at-123").with_refresh_token("rt-456");
        let debug = format!("{pair:?}");
        assert!(!debug.contains("at-123"));
        assert!(!debug.contains("rt-456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn from_response_requires_access_token() {
        let empty = OAuthTokenResponse {
            access_token: Some(String::new()),
            refresh_token: None,
            expires_in: None,
        };
        assert!(TokenPair::from_response(empty).is_none());

        let full = OAuthTokenResponse {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            expires_in: Some(3600),
        };
        let pair = TokenPair::from_response(full).unwrap();
        assert_eq!(pair.access_token.expose_secret(), "at");
        assert!(pair.expires_at.unwrap() > unix_now());
        assert!(!pair.is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        assert!(TokenPair::new("at").with_expires_at(1).is_expired());
        assert!(!TokenPair::new("at").is_expired());
    }

    #[test]
    fn serializes_exposed_values_for_storage() {
        let pair = TokenPair::new("at").with_refresh_token("rt");
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["access_token"], "at");
        assert_eq!(json["refresh_token"], "rt");
    }
}
