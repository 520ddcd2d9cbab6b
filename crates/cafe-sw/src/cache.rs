//! Cache buckets and the storage that holds them.
//!
//! ```text
//! CacheStorage
//!     ├── cafe-app-shell-<tag>   (precache)
//!     │       └── URL → CacheEntry
//!     └── cafe-runtime-<tag>     (runtime)
//!             └── URL → CacheEntry
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cafe_net::Response;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::ServiceWorkerError;

/// Cache storage shared between the router, policies and lifecycle.
pub type SharedCaches = Arc<RwLock<CacheStorage>>;

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in order, repeated names kept, raw value bytes.
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under the given request URL.
    pub fn from_response(url: Url, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        Self {
            url,
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(n, v);
            }
        }

        Response {
            url: self.url.clone(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone(),
            from_cache: true,
        }
    }

    /// Approximate storage cost of this entry.
    pub fn size_bytes(&self) -> usize {
        self.url.as_str().len()
            + self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A single named bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by cache key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any entry with the same key.
    pub fn put(&mut self, key: &str, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key.to_string(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total storage cost of all entries.
    pub fn size_bytes(&self) -> usize {
        self.entries.values().map(CacheEntry::size_bytes).sum()
    }
}

/// All buckets, in creation order.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: Vec<Cache>,
    quota_bytes: Option<usize>,
}

impl CacheStorage {
    /// Create new cache storage without a quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage that refuses writes beyond `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            caches: Vec::new(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Wrap into the shared handle used by the manager.
    pub fn shared(self) -> SharedCaches {
        Arc::new(RwLock::new(self))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        let index = match self.caches.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.caches.push(Cache::new(name));
                self.caches.len() - 1
            }
        };
        &mut self.caches[index]
    }

    /// Look up a bucket without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.caches.len();
        self.caches.retain(|c| c.name != name);
        self.caches.len() != before
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.iter().map(|c| c.name.as_str()).collect()
    }

    /// Match across all caches, oldest bucket first.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.caches.iter().find_map(|c| c.match_request(key))
    }

    /// Match within one bucket.
    pub fn match_in(&self, bucket: &str, key: &str) -> Option<&CacheEntry> {
        self.get(bucket).and_then(|c| c.match_request(key))
    }

    /// Store an entry in `bucket`, creating the bucket if needed.
    pub fn put(&mut self, bucket: &str, key: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        if let Some(quota) = self.quota_bytes {
            let replaced = self
                .match_in(bucket, key)
                .map(CacheEntry::size_bytes)
                .unwrap_or(0);
            let used = self.size_bytes() - replaced;
            let needed = entry.size_bytes();
            if used + needed > quota {
                return Err(ServiceWorkerError::QuotaExceeded {
                    bucket: bucket.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        self.open(bucket).put(key, entry);
        Ok(())
    }

    /// Total storage cost across all buckets.
    pub fn size_bytes(&self) -> usize {
        self.caches.iter().map(Cache::size_bytes).sum()
    }
}
