//! Shared key/value cache with per-entry TTL.
//!
//! Rate limit windows, webhook subscriptions and health snapshots live here.
//! [`SharedCache`] is the seam for an external store; [`LocalCache`] is the
//! in-process LRU implementation used by default and in tests.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::ProviderType;

/// Minimal string cache contract. Failures degrade to misses; callers never block on the cache.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
}

impl dyn SharedCache {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, error = %err, "Discarding undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(err) => tracing::warn!(key, error = %err, "Failed to encode cache entry"),
        }
    }
}

pub type SharedCacheRef = Arc<dyn SharedCache>;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process LRU with lazy expiry.
pub struct LocalCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn shared(capacity: usize) -> SharedCacheRef {
        Arc::new(Self::new(capacity))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedCache for LocalCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.put(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().await.pop(key);
    }
}

/// `ratelimit:{provider}:{tenant|global}`
pub fn rate_limit_key(provider: ProviderType, tenant_id: Option<Uuid>) -> String {
    match tenant_id {
        Some(tenant) => format!("ratelimit:{}:{}", provider, tenant),
        None => format!("ratelimit:{}:global", provider),
    }
}

pub fn webhook_subscription_key(tenant_id: Uuid, provider: ProviderType) -> String {
    format!("webhook_sub:{}:{}", tenant_id, provider)
}

pub fn health_key(tenant_id: Uuid, provider: ProviderType) -> String {
    format!("health:{}:{}", tenant_id, provider)
}
