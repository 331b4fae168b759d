//! Cache buckets and the store abstraction the controller writes through.
//!
//! ```text
//! CacheStore
//!     └── Cache (bucket, e.g. falcontruck-static-v1.0.0)
//!             └── request key → CacheEntry
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use falcon_net::Response;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{Result, SwError};

/// Normalized identity of a request: the absolute URL without its fragment.
pub fn request_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in order; a repeated name appears once per value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for the given request URL and method.
    pub fn capture(url: &Url, method: &Method, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request_key(url),
            method: method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the stored entry.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url).map_err(|e| SwError::Cache(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| SwError::Cache(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

/// A single named bucket.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Bucket name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace an entry.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializable image of every bucket in a store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub caches: Vec<Cache>,
}

/// Persistent bucket storage owned by the controller.
///
/// Implementations give per-entry atomicity only; nothing here spans keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, bucket: &str) -> Result<()>;

    /// Look up a request key in one bucket.
    async fn match_in(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, creating the bucket if needed.
    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<()>;

    /// Names of every bucket, current or stale.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a whole bucket. Returns whether it existed.
    async fn delete(&self, bucket: &str) -> Result<bool>;
}

/// In-memory store, snapshot-able to JSON.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        let caches = snapshot
            .caches
            .into_iter()
            .map(|cache| (cache.name.clone(), cache))
            .collect();
        Self {
            caches: RwLock::new(caches),
        }
    }

    /// Copy out every bucket, sorted by name.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let caches = self.caches.read().await;
        let mut caches: Vec<Cache> = caches.values().cloned().collect();
        caches.sort_by(|a, b| a.name.cmp(&b.name));
        CacheSnapshot { caches }
    }

    /// Number of entries in a bucket, if it exists.
    pub async fn entry_count(&self, bucket: &str) -> Option<usize> {
        self.caches.read().await.get(bucket).map(Cache::len)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, bucket: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(bucket.to_string())
            .or_insert_with(|| Cache::new(bucket));
        Ok(())
    }

    async fn match_in(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>> {
        let caches = self.caches.read().await;
        let hit = caches
            .get(bucket)
            .and_then(|cache| cache.match_request(key))
            .cloned();
        trace!(bucket, key, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }

    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<()> {
        debug!(bucket, url = %entry.url, status = entry.status, "Cache put");
        self.caches
            .write()
            .await
            .entry(bucket.to_string())
            .or_insert_with(|| Cache::new(bucket))
            .put(entry);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(bucket).is_some())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
