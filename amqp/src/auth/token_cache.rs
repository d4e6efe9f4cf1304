use super::provider::AccessToken;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Margin before expiry at which a cached token is no longer handed out.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// Per-audience token cache.
///
/// Holds at most one token per audience; [`TokenCache::set`] replaces the
/// previous entry instead of merging.
#[derive(Clone)]
pub struct TokenCache {
    cache: Arc<RwLock<HashMap<String, AccessToken>>>,
    refresh_buffer: Duration,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_refresh_buffer(REFRESH_BUFFER)
    }

    pub fn with_refresh_buffer(refresh_buffer: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            refresh_buffer,
        }
    }

    /// Returns the cached token for `audience` unless it is within the refresh
    /// buffer of its expiry.
    pub async fn get(&self, audience: &str) -> Option<AccessToken> {
        let cache = self.cache.read().await;
        cache
            .get(audience)
            .filter(|token| !self.needs_refresh_at(token, Utc::now()))
            .cloned()
    }

    pub async fn set(&self, audience: String, token: AccessToken) {
        let mut cache = self.cache.write().await;
        cache.insert(audience, token);
    }

    pub async fn invalidate(&self, audience: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(audience);
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn needs_refresh(&self, audience: &str) -> bool {
        let cache = self.cache.read().await;
        cache
            .get(audience)
            .map(|token| self.needs_refresh_at(token, Utc::now()))
            .unwrap_or(true)
    }

    fn needs_refresh_at(&self, token: &AccessToken, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::from_std(self.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + buffer >= token.expires_on
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}
