//! Named caches and the storage that owns them.
//!
//! Each [`Cache`] maps a normalized request key (method + URL) to a
//! response snapshot. A single `put` or `match` is atomic; there are no
//! cross-entry transactions, and concurrent writers to one key resolve
//! last-write-wins.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hymnal_net::{Request, Response};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Entries ====================

/// One stored header line. Names may repeat; values are kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    pub name: String,
    #[serde(with = "bytes_base64")]
    pub value: Vec<u8>,
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

    /// Response headers in wire order.
    pub headers: Vec<CachedHeader>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| CachedHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        let mut url = request.url.clone();
        url.set_fragment(None);

        Self {
            url: url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Storage key, identical to [`Request::cache_key`] of the original request.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached status: {e}")))?;

        let mut headers = HeaderMap::new();
        for header in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Response::new(url, status, headers, self.body.clone()).from_cache())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: From<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(T::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A named cache.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl Cache {
    /// Create a cache, bounded to `max_entries` if given.
    pub fn new(name: &str, max_entries: Option<usize>) -> Self {
        let entries = match max_entries.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            name: name.to_string(),
            entries: Mutex::new(entries),
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a request. A hit refreshes the entry's recency.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let entry = self.entries.lock().await.get(&request.cache_key()).cloned()?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(cache = %self.name, url = %request.url, error = %e, "Dropping unreadable entry");
                self.entries.lock().await.pop(&request.cache_key());
                None
            }
        }
    }

    /// Store a response. Only GET requests can be cached.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }

        let entry = CacheEntry::from_response(request, response);
        let evicted = self.entries.lock().await.push(request.cache_key(), entry);
        if let Some((key, _)) = evicted.filter(|(key, _)| *key != request.cache_key()) {
            debug!(cache = %self.name, evicted = %key, "Evicted least recently used entry");
        }
        Ok(())
    }

    /// Remove the entry for `request`.
    pub async fn delete(&self, request: &Request) -> bool {
        self.entries.lock().await.pop(&request.cache_key()).is_some()
    }

    /// Stored keys, most recently used first.
    pub async fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache has no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn set_max_entries(&self, max_entries: Option<usize>) {
        let cap = max_entries
            .and_then(NonZeroUsize::new)
            .unwrap_or(NonZeroUsize::MAX);
        let mut entries = self.entries.lock().await;
        if entries.cap() != cap {
            entries.resize(cap);
        }
    }

    async fn snapshot(&self) -> CacheSnapshot {
        let entries = self.entries.lock().await;
        let max_entries = (entries.cap() != NonZeroUsize::MAX).then(|| entries.cap().get());
        // Oldest first, so replaying the list restores recency order.
        let mut list: Vec<CacheEntry> = entries.iter().map(|(_, e)| e.clone()).collect();
        list.reverse();
        CacheSnapshot {
            name: self.name.clone(),
            max_entries,
            entries: list,
        }
    }
}

// ==================== Cache Storage ====================

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    max_entries: Option<usize>,
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<CacheSnapshot>,
}

/// All named caches of one origin, shared by every supervisor generation.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Arc<Cache>>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates an unbounded one if it doesn't exist).
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        if let Some(cache) = self.caches.read().await.get(name).cloned() {
            return cache;
        }
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Cache::new(name, None)))
            .clone()
    }

    /// Open a cache with an LRU cap (creates if it doesn't exist).
    ///
    /// Reopening an existing cache applies the new cap.
    pub async fn open_bounded(&self, name: &str, max_entries: Option<usize>) -> Arc<Cache> {
        let cache = self.open(name).await;
        cache.set_max_entries(max_entries).await;
        cache
    }

    /// Look up `request` in the named cache without creating it.
    pub async fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        let cache = self.caches.read().await.get(name).cloned()?;
        cache.match_request(request).await
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write every cache to `path` as JSON.
    pub async fn persist(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let caches: Vec<Arc<Cache>> = self.caches.read().await.values().cloned().collect();
        let mut snapshot = StorageSnapshot { caches: Vec::new() };
        for cache in caches {
            snapshot.caches.push(cache.snapshot().await);
        }
        snapshot.caches.sort_by(|a, b| a.name.cmp(&b.name));

        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), caches = snapshot.caches.len(), "Cache storage persisted");
        Ok(())
    }

    /// Load storage from a snapshot written by [`CacheStorage::persist`].
    ///
    /// A missing file yields empty storage.
    pub async fn restore(path: &Path) -> Result<Self, ServiceWorkerError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: StorageSnapshot = serde_json::from_slice(&raw)?;

        let mut caches = HashMap::new();
        for cached in snapshot.caches {
            let cache = Cache::new(&cached.name, cached.max_entries);
            {
                let mut entries = cache.entries.lock().await;
                for entry in cached.entries {
                    entries.put(entry.key(), entry);
                }
            }
            caches.insert(cached.name, Arc::new(cache));
        }

        info!(path = %path.display(), caches = caches.len(), "Cache storage restored");
        Ok(Self {
            caches: RwLock::new(caches),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    fn response(url: &str, body: &'static str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        Response::new(
            Url::parse(url).unwrap(),
            StatusCode::OK,
            headers,
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let cache = Cache::new("hymnal-dynamic-v1", None);
        let url = "https://hymnal.app/songs/1";
        cache.put(&request(url), &response(url, "Amazing Grace")).await.unwrap();

        let hit = cache.match_request(&request(url)).await.unwrap();
        assert_eq!(hit.text().unwrap(), "Amazing Grace");
        assert_eq!(hit.source, hymnal_net::ResponseSource::Cache);
        assert_eq!(hit.header("content-type"), Some("text/plain"));
        assert!(cache.match_request(&request("https://hymnal.app/songs/2")).await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_and_binary_headers_survive() {
        let url = "https://hymnal.app/songs/7";
        let mut network = response(url, "Be Thou My Vision");
        network.headers.append("link", HeaderValue::from_static("</a.css>; rel=preload"));
        network.headers.append("link", HeaderValue::from_static("</b.js>; rel=preload"));
        network
            .headers
            .insert("x-bin", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        let cache = Cache::new("hymnal-dynamic-v1", None);
        cache.put(&request(url), &network).await.unwrap();
        let hit = cache.match_request(&request(url)).await.unwrap();

        assert_eq!(hit.headers.get_all("link").iter().count(), 2);
        assert_eq!(hit.headers.get("x-bin").unwrap().as_bytes(), b"caf\xe9");

        // The snapshot format keeps them too.
        let entry = CacheEntry::from_response(&request(url), &network);
        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.to_response().unwrap().headers, network.headers);
    }

    #[tokio::test]
    async fn test_rejects_non_get() {
        let cache = Cache::new("c", None);
        let url = "https://hymnal.app/api/favourites";
        let post = request(url).with_method(Method::POST);
        assert!(matches!(
            cache.put(&post, &response(url, "{}")).await,
            Err(ServiceWorkerError::CacheError(_))
        ));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = Cache::new("c", None);
        let url = "https://hymnal.app/static/hymns.json";
        cache.put(&request(url), &response(url, "old")).await.unwrap();
        cache.put(&request(url), &response(url, "new")).await.unwrap();

        assert_eq!(cache.len().await, 1);
        let hit = cache.match_request(&request(url)).await.unwrap();
        assert_eq!(hit.text().unwrap(), "new");
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_reads() {
        let cache = Cache::new("c", Some(2));
        let (a, b, c) = (
            "https://hymnal.app/a",
            "https://hymnal.app/b",
            "https://hymnal.app/c",
        );
        cache.put(&request(a), &response(a, "a")).await.unwrap();
        cache.put(&request(b), &response(b, "b")).await.unwrap();

        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.match_request(&request(a)).await.is_some());
        cache.put(&request(c), &response(c, "c")).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert!(cache.match_request(&request(a)).await.is_some());
        assert!(cache.match_request(&request(b)).await.is_none());
        assert!(cache.match_request(&request(c)).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let cache = Cache::new("c", None);
        let url = "https://hymnal.app/a";
        cache.put(&request(url), &response(url, "a")).await.unwrap();
        assert!(cache.delete(&request(url)).await);
        assert!(!cache.delete(&request(url)).await);
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = CacheStorage::new();
        assert!(!storage.has("hymnal-static-v1").await);

        storage.open("hymnal-static-v1").await;
        storage.open("hymnal-dynamic-v1").await;
        assert_eq!(
            storage.keys().await,
            vec!["hymnal-dynamic-v1".to_string(), "hymnal-static-v1".to_string()]
        );

        assert!(storage.delete("hymnal-static-v1").await);
        assert!(!storage.has("hymnal-static-v1").await);
    }

    #[tokio::test]
    async fn test_match_in_does_not_create() {
        let storage = CacheStorage::new();
        assert!(storage
            .match_in("hymnal-static-v1", &request("https://hymnal.app/"))
            .await
            .is_none());
        assert!(!storage.has("hymnal-static-v1").await);
    }

    #[tokio::test]
    async fn test_reopen_applies_cap() {
        let storage = CacheStorage::new();
        let cache = storage.open("d").await;
        for i in 0..5 {
            let url = format!("https://hymnal.app/{i}");
            cache.put(&request(&url), &response(&url, "x")).await.unwrap();
        }
        let cache = storage.open_bounded("d", Some(3)).await;
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let storage = CacheStorage::new();
        let dynamic = storage.open_bounded("hymnal-dynamic-v1", Some(10)).await;
        let (a, b) = ("https://hymnal.app/a", "https://hymnal.app/b");
        dynamic.put(&request(a), &response(a, "first")).await.unwrap();
        dynamic.put(&request(b), &response(b, "second")).await.unwrap();
        storage.open("hymnal-v1").await;
        storage.persist(&path).await.unwrap();

        let restored = CacheStorage::restore(&path).await.unwrap();
        assert_eq!(restored.keys().await, storage.keys().await);

        let cache = restored.open_bounded("hymnal-dynamic-v1", Some(10)).await;
        assert_eq!(cache.keys().await, dynamic.keys().await);
        let hit = cache.match_request(&request(b)).await.unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_restore_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::restore(&dir.path().join("none.json")).await.unwrap();
        assert!(storage.keys().await.is_empty());
    }
}
