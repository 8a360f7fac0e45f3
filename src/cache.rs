//! Response cache collaborator
//!
//! The gateway only needs `get` and `put`. [`MemoryCache`] is an in-process
//! implementation with per-entry expiry; a shared cache service can be
//! plugged in by implementing [`ResponseCache`].

use crate::GatewayResponse;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::debug;

/// A stored response and the instant it stops being fresh.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: GatewayResponse,
    pub expires_at: SystemTime,
}

impl CachedResponse {
    pub fn new(response: GatewayResponse, ttl: Duration) -> Self {
        Self {
            response,
            expires_at: SystemTime::now() + ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.expires_at > SystemTime::now()
    }
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;

    async fn put(&self, key: String, entry: CachedResponse);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CachedResponse>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh());
        before.saturating_sub(self.entries.len())
    }

    /// Purges expired entries every `interval` until the cache is dropped.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };

                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired cache entries", purged);
                }
            }
        })
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh() {
                return Some(entry.clone());
            }
            // Expired. A fresh entry put since the read is kept.
            drop(entry);
            self.entries.remove_if(key, |_, entry| !entry.is_fresh());
        }
        None
    }

    async fn put(&self, key: String, entry: CachedResponse) {
        self.entries.insert(key, entry);
    }
}
