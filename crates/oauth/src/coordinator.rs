//! Backend-brokered OAuth: initiate, poll for completion, fetch tokens.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Serialize, de::DeserializeOwned},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use atp_protocol::{
    API_KEY_HEADER, OAuthInitiateRequest, OAuthInitiateResponse, OAuthStatus,
    OAuthStatusResponse, OAuthTokenResponse, OAuthUserRequest, paths,
};

use crate::{
    cache::TokenCache,
    error::{Context, Error, Result},
    types::{OAuthSession, TokenPair},
};

type SessionKey = (String, String);

/// Drives the OAuth connection flow against the ATP backend.
pub struct OAuthCoordinator {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    cache: TokenCache,
    sessions: Mutex<HashMap<SessionKey, OAuthSession>>,
}

impl OAuthCoordinator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: Secret::new(api_key.into()),
            cache: TokenCache::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &atp_config::AtpConfig) -> Self {
        Self::new(config.http_base(), config.api_key.expose_secret().clone())
    }

    /// Share an existing cache (typically the one the toolkit client reads).
    #[must_use]
    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Start an authorization and return the URL the end user must visit.
    pub async fn initiate(
        &self,
        platform_id: &str,
        external_user_id: &str,
        redirect_url: &str,
    ) -> Result<String> {
        let body = OAuthInitiateRequest {
            platform_id: platform_id.into(),
            external_user_id: external_user_id.into(),
            redirect_url: redirect_url.into(),
        };
        let resp: OAuthInitiateResponse = match self.post(paths::OAUTH_INITIATE, &body).await {
            Err(Error::Backend { status: 404, .. }) => {
                return Err(Error::PlatformNotFound {
                    platform_id: platform_id.into(),
                });
            },
            other => other?,
        };

        info!(platform_id, external_user_id, "oauth flow initiated");
        self.lock_sessions().insert(
            key(platform_id, external_user_id),
            OAuthSession {
                platform_id: platform_id.into(),
                external_user_id: external_user_id.into(),
                authorization_url: resp.authorization_url.clone(),
                integration_id: None,
                status: OAuthStatus::Pending,
            },
        );
        Ok(resp.authorization_url)
    }

    /// One status poll. Updates the tracked session, if any.
    pub async fn status(
        &self,
        platform_id: &str,
        external_user_id: &str,
    ) -> Result<OAuthStatusResponse> {
        let body = user_request(platform_id, external_user_id);
        let resp: OAuthStatusResponse = match self.post(paths::OAUTH_STATUS, &body).await {
            Err(Error::Backend { status: 404, .. }) => {
                return Err(Error::PlatformNotFound {
                    platform_id: platform_id.into(),
                });
            },
            other => other?,
        };

        if let Some(session) = self
            .lock_sessions()
            .get_mut(&key(platform_id, external_user_id))
        {
            session.status = resp.status;
            if resp.integration_id.is_some() {
                session.integration_id.clone_from(&resp.integration_id);
            }
        }
        Ok(resp)
    }

    /// Poll until the integration completes and return its id.
    ///
    /// Transient network failures between polls are logged and retried.
    /// Fails with [`Error::OAuthTimeout`] when `timeout` elapses or the backend
    /// reports the session expired, and with [`Error::Cancelled`] as soon as
    /// `cancel` fires.
    pub async fn wait_for_connection(
        &self,
        platform_id: &str,
        external_user_id: &str,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || {
            self.forget(platform_id, external_user_id);
            Error::OAuthTimeout {
                platform_id: platform_id.into(),
            }
        };

        loop {
            let poll = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                res = tokio::time::timeout_at(deadline, self.status(platform_id, external_user_id)) => res,
            };

            match poll {
                Err(_elapsed) => return Err(timed_out()),
                Ok(Ok(resp)) => match resp.status {
                    OAuthStatus::Completed => {
                        let Some(integration_id) = resp.integration_id.filter(|id| !id.is_empty()) else {
                            warn!(platform_id, external_user_id, "completed status carried no integration id");
                            return Err(Error::MissingIntegration {
                                platform_id: platform_id.into(),
                            });
                        };
                        info!(platform_id, external_user_id, %integration_id, "oauth integration completed");
                        return Ok(integration_id);
                    },
                    OAuthStatus::Expired => {
                        warn!(platform_id, external_user_id, "oauth session expired");
                        return Err(timed_out());
                    },
                    OAuthStatus::Pending => {
                        debug!(platform_id, external_user_id, "oauth still pending");
                    },
                },
                Ok(Err(e @ Error::PlatformNotFound { .. })) => return Err(e),
                Ok(Err(e)) => {
                    warn!(platform_id, external_user_id, error = %e, "oauth status poll failed");
                },
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(timed_out()),
                () = tokio::time::sleep(poll_interval) => {},
            }
        }
    }

    /// Fetch the current token pair and store it in the shared cache.
    pub async fn get_user_tokens(
        &self,
        platform_id: &str,
        external_user_id: &str,
    ) -> Result<TokenPair> {
        let unavailable = || Error::TokensUnavailable {
            platform_id: platform_id.into(),
            external_user_id: external_user_id.into(),
        };

        let body = user_request(platform_id, external_user_id);
        let resp: OAuthTokenResponse = match self.post(paths::OAUTH_TOKENS, &body).await {
            Err(Error::Backend { status: 404, .. }) => return Err(unavailable()),
            other => other?,
        };
        let tokens = TokenPair::from_response(resp).ok_or_else(unavailable)?;

        self.cache
            .insert(platform_id, external_user_id, tokens.clone());
        self.forget(platform_id, external_user_id);
        Ok(tokens)
    }

    /// Snapshot of the tracked session, if one is in progress.
    pub fn session(&self, platform_id: &str, external_user_id: &str) -> Option<OAuthSession> {
        self.lock_sessions()
            .get(&key(platform_id, external_user_id))
            .cloned()
    }

    fn forget(&self, platform_id: &str, external_user_id: &str) {
        self.lock_sessions()
            .remove(&key(platform_id, external_user_id));
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, OAuthSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).with_context(|| format!("unexpected response from {path}"))
    }
}

fn key(platform_id: &str, external_user_id: &str) -> SessionKey {
    (platform_id.to_string(), external_user_id.to_string())
}

fn user_request(platform_id: &str, external_user_id: &str) -> OAuthUserRequest {
    OAuthUserRequest {
        platform_id: platform_id.into(),
        external_user_id: external_user_id.into(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use {super::*, mockito::Matcher, serde_json::json};

    const POLL: Duration = Duration::from_millis(10);

    async fn mock_json(
        server: &mut mockito::ServerGuard,
        path: &str,
        status: usize,
        body: serde_json::Value,
    ) -> mockito::Mock {
        server
            .mock("POST", path)
            .match_header(API_KEY_HEADER, "test-key")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await
    }

    #[tokio::test]
    async fn hubspot_flow_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let initiate = server
            .mock("POST", paths::OAUTH_INITIATE)
            .match_header(API_KEY_HEADER, "test-key")
            .match_body(Matcher::PartialJson(json!({
                "platform_id": "hubspot",
                "external_user_id": "user-1",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"authorization_url": "https://app.hubspot.com/oauth/authorize?x=1"}).to_string())
            .create_async()
            .await;

        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let status = server
            .mock("POST", paths::OAUTH_STATUS)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    json!({"status": "pending"}).to_string().into()
                } else {
                    json!({"status": "completed", "integration_id": "int_42"})
                        .to_string()
                        .into()
                }
            })
            .expect_at_least(3)
            .create_async()
            .await;
        let tokens = mock_json(
            &mut server,
            paths::OAUTH_TOKENS,
            200,
            json!({"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 3600}),
        )
        .await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let url = oauth
            .initiate("hubspot", "user-1", "https://example.com/done")
            .await
            .unwrap();
        assert!(url.starts_with("https://app.hubspot.com/"));

        let first = oauth.status("hubspot", "user-1").await.unwrap();
        assert_eq!(first.status, OAuthStatus::Pending);
        assert_eq!(
            oauth.session("hubspot", "user-1").unwrap().status,
            OAuthStatus::Pending
        );

        let integration = oauth
            .wait_for_connection(
                "hubspot",
                "user-1",
                POLL,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(integration, "int_42");
        assert_eq!(
            oauth.session("hubspot", "user-1").unwrap().integration_id.as_deref(),
            Some("int_42")
        );

        let pair = oauth.get_user_tokens("hubspot", "user-1").await.unwrap();
        assert_eq!(pair.access_token.expose_secret(), "at-1");
        assert!(oauth.cache().get_valid("hubspot", "user-1").is_some());
        assert!(oauth.session("hubspot", "user-1").is_none());

        initiate.assert_async().await;
        status.assert_async().await;
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_platform() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(
            &mut server,
            paths::OAUTH_INITIATE,
            404,
            json!({"detail": "no such platform"}),
        )
        .await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth
            .initiate("nope", "u", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlatformNotFound { ref platform_id } if platform_id == "nope"));
    }

    #[tokio::test]
    async fn network_error_on_unreachable_backend() {
        let oauth = OAuthCoordinator::new("http://127.0.0.1:1", "test-key");
        let err = oauth
            .initiate("hubspot", "u", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn wait_times_out_while_pending() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_STATUS, 200, json!({"status": "pending"})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth
            .wait_for_connection(
                "hubspot",
                "u",
                POLL,
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OAuthTimeout { .. }));
    }

    #[tokio::test]
    async fn completion_without_integration_id_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_STATUS, 200, json!({"status": "completed"})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth
            .wait_for_connection(
                "hubspot",
                "u",
                POLL,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingIntegration { ref platform_id } if platform_id == "hubspot"));
    }

    #[tokio::test]
    async fn undecodable_body_names_the_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", paths::OAUTH_INITIATE)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth
            .initiate("hubspot", "u", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Message { .. }));
        assert!(
            err.to_string()
                .starts_with(&format!("unexpected response from {}: ", paths::OAUTH_INITIATE)),
            "{err}"
        );
    }

    #[tokio::test]
    async fn expired_session_ends_wait() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_STATUS, 200, json!({"status": "expired"})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth
            .wait_for_connection(
                "hubspot",
                "u",
                POLL,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OAuthTimeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_polling_promptly() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_STATUS, 200, json!({"status": "pending"})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = oauth
            .wait_for_connection(
                "hubspot",
                "u",
                Duration::from_secs(10),
                Duration::from_secs(60),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tokens_unavailable_before_completion() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_TOKENS, 404, json!({"detail": "not connected"})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth.get_user_tokens("gmail", "u").await.unwrap_err();
        assert!(matches!(err, Error::TokensUnavailable { .. }));
        assert!(oauth.cache().is_empty());
    }

    #[tokio::test]
    async fn tokens_without_access_token_are_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _m = mock_json(&mut server, paths::OAUTH_TOKENS, 200, json!({"access_token": null})).await;

        let oauth = OAuthCoordinator::new(server.url(), "test-key");
        let err = oauth.get_user_tokens("gmail", "u").await.unwrap_err();
        assert!(matches!(err, Error::TokensUnavailable { .. }));
    }
}
