//! Response caching for deterministic replays.
//!
//! Keyed by a SHA-256 digest over the model id and the serialized request.
//! Wrapping the chat client in [`CachedChatClient`] makes a repeated run
//! over the same input produce an identical flagged set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

use super::client::ChatClient;
use super::types::{GenerateRequest, GenerateResponse};

/// Cache key derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(request: &GenerateRequest) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(request)?);
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, GenerateResponse>,
    stats: CacheStats,
}

/// In-memory response cache.
#[derive(Default)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<GenerateResponse> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(key).cloned() {
            Some(response) => {
                inner.stats.hits += 1;
                Some(response)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: CacheKey, response: GenerateResponse) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.insert(key, response);
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stats
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chat client wrapper that serves repeated requests from the cache.
pub struct CachedChatClient {
    inner: Arc<dyn ChatClient>,
    cache: ResponseCache,
}

impl CachedChatClient {
    pub fn new(inner: Arc<dyn ChatClient>) -> Self {
        Self {
            inner,
            cache: ResponseCache::new(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl ChatClient for CachedChatClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let key = CacheKey::for_request(&request)?;
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let response = self.inner.generate(request).await?;
        self.cache.put(key, response.clone());
        Ok(response)
    }
}
