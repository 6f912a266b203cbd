use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::types::TokenPair;

type Key = (String, String);

/// Shared `(platform_id, external_user_id) → TokenPair` map.
///
/// Cloning is cheap; all clones see the same entries. Writes replace
/// whatever was there (last write wins).
#[derive(Clone, Default)]
pub struct TokenCache {
    inner: Arc<RwLock<HashMap<Key, TokenPair>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, platform_id: &str, external_user_id: &str, tokens: TokenPair) {
        debug!(platform_id, external_user_id, "caching oauth tokens");
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert((platform_id.to_string(), external_user_id.to_string()), tokens);
    }

    /// Cached tokens, expired entries included.
    pub fn get(&self, platform_id: &str, external_user_id: &str) -> Option<TokenPair> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&(platform_id.to_string(), external_user_id.to_string()))
            .cloned()
    }

    /// Cached tokens that have not yet expired.
    pub fn get_valid(&self, platform_id: &str, external_user_id: &str) -> Option<TokenPair> {
        self.get(platform_id, external_user_id)
            .filter(|t| !t.is_expired())
    }

    pub fn remove(&self, platform_id: &str, external_user_id: &str) -> Option<TokenPair> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&(platform_id.to_string(), external_user_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn clones_share_entries() {
        let cache = TokenCache::new();
        let other = cache.clone();
        cache.insert("hubspot", "u1", TokenPair::new("first"));
        assert_eq!(
            other.get("hubspot", "u1").unwrap().access_token.expose_secret(),
            "first"
        );
        assert!(other.get("hubspot", "u2").is_none());
    }

    #[test]
    fn last_write_wins() {
        let cache = TokenCache::new();
        cache.insert("gmail", "u1", TokenPair::new("old"));
        cache.insert("gmail", "u1", TokenPair::new("new"));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("gmail", "u1").unwrap().access_token.expose_secret(),
            "new"
        );
    }

    #[test]
    fn get_valid_skips_expired() {
        let cache = TokenCache::new();
        cache.insert("gmail", "u1", TokenPair::new("stale").with_expires_at(1));
        assert!(cache.get("gmail", "u1").is_some());
        assert!(cache.get_valid("gmail", "u1").is_none());
    }

    #[test]
    fn remove_clears_entry() {
        let cache = TokenCache::new();
        cache.insert("slack", "u1", TokenPair::new("t"));
        assert!(cache.remove("slack", "u1").is_some());
        assert!(cache.is_empty());
    }
}
