use {secrecy::ExposeSecret, serde_json::Value, tracing::debug};

use atp_oauth::TokenCache;

use crate::{
    dispatcher::InvocationRequest,
    error::{Error, Result},
    registry::{AuthRequirement, ToolArgs},
};

/// Resolves a tool's auth requirement into a concrete token.
///
/// Priority: the token carried by the request, then a cached OAuth token for
/// the requirement's provider and the caller's identity (the request's
/// `user_id`, falling back to the client's default identity). No network I/O.
#[derive(Debug, Clone, Default)]
pub struct AuthInjector {
    cache: Option<TokenCache>,
    default_identity: Option<String>,
}

impl AuthInjector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.default_identity = Some(identity.into());
        self
    }

    pub fn resolve(&self, requirement: &AuthRequirement, request: &InvocationRequest) -> Result<String> {
        if let Some(token) = request.auth_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }

        let identity = request
            .user_id
            .as_deref()
            .or(self.default_identity.as_deref());
        if let (Some(cache), Some(user)) = (&self.cache, identity)
            && let Some(tokens) = cache.get_valid(&requirement.provider, user)
        {
            debug!(provider = %requirement.provider, user, "using cached oauth token");
            return Ok(tokens.access_token.expose_secret().clone());
        }

        Err(Error::AuthTokenUnavailable {
            provider: requirement.provider.clone(),
        })
    }

    /// Resolve and place the token into `args` under the requirement's argument name.
    pub fn inject(
        &self,
        requirement: &AuthRequirement,
        request: &InvocationRequest,
        args: &mut ToolArgs,
    ) -> Result<()> {
        let token = self.resolve(requirement, request)?;
        args.insert(requirement.inject_as.clone(), Value::String(token));
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, atp_oauth::TokenPair};

    fn requirement() -> AuthRequirement {
        AuthRequirement {
            provider: "gmail".into(),
            scheme: "oauth2".into(),
            inject_as: "access_token".into(),
        }
    }

    fn request(auth_token: Option<&str>, user_id: Option<&str>) -> InvocationRequest {
        InvocationRequest {
            request_id: "r1".into(),
            tool_name: "send_mail".into(),
            params: ToolArgs::new(),
            auth_token: auth_token.map(Into::into),
            user_id: user_id.map(Into::into),
        }
    }

    #[test]
    fn request_token_wins_over_cache() {
        let cache = TokenCache::new();
        cache.insert("gmail", "u1", TokenPair::new("cached"));
        let injector = AuthInjector::new().with_cache(cache);

        let token = injector
            .resolve(&requirement(), &request(Some("inline"), Some("u1")))
            .unwrap();
        assert_eq!(token, "inline");
    }

    #[test]
    fn falls_back_to_cache_for_request_user() {
        let cache = TokenCache::new();
        cache.insert("gmail", "u1", TokenPair::new("cached-u1"));
        let injector = AuthInjector::new().with_cache(cache);

        let mut args = ToolArgs::new();
        injector
            .inject(&requirement(), &request(None, Some("u1")), &mut args)
            .unwrap();
        assert_eq!(args["access_token"], "cached-u1");
    }

    #[test]
    fn default_identity_used_without_user_id() {
        let cache = TokenCache::new();
        cache.insert("gmail", "owner", TokenPair::new("owner-token"));
        let injector = AuthInjector::new().with_cache(cache).with_identity("owner");

        let token = injector.resolve(&requirement(), &request(Some(""), None)).unwrap();
        assert_eq!(token, "owner-token");
    }

    #[test]
    fn expired_or_missing_tokens_are_unavailable() {
        let cache = TokenCache::new();
        cache.insert("gmail", "u1", TokenPair::new("old").with_expires_at(1));
        let injector = AuthInjector::new().with_cache(cache);

        let err = injector
            .resolve(&requirement(), &request(None, Some("u1")))
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing authentication token");

        assert!(
            AuthInjector::new()
                .resolve(&requirement(), &request(None, None))
                .is_err()
        );
    }
}
