// src/modules/cache.rs
//! Read-through module cache
//!
//! Maps a logical path to source text and its content hash.
//!
//! # Resolution order
//!
//! 1. Hot tier (cache store) by exact key
//! 2. On miss, origin storage by logical path
//! 3. On origin hit, write back with a bounded TTL and add the path to the index
//! 4. On origin miss, `None`
//!
//! Transport failures on either tier are logged and collapse to a miss; they
//! never propagate into import resolution.
//!
//! # Module index
//!
//! The index is a set of every known path. Import resolution consults an
//! in-process snapshot of it before touching the store, so imports of names
//! that were never pushed cost nothing. The snapshot is trusted until
//! `invalidate_index()` is called or it outlives `index_max_age`.

use crate::modules::entry_codec::EntryCodec;
use crate::modules::origin::CodeOrigin;
use crate::store::{CacheStore, Keys};
use crate::utils::config::ModuleCacheSettings;
use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::sha256_hex;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Module cache configuration
#[derive(Debug, Clone)]
pub struct ModuleCacheConfig {
    /// Key/channel prefix in the cache store
    pub key_prefix: String,

    /// TTL of hot-tier entries
    pub ttl: Duration,

    /// How long an index snapshot is trusted without invalidation
    pub index_max_age: Duration,

    /// zstd level for hot-tier values
    pub compression_level: i32,

    /// Values smaller than this are stored uncompressed
    pub compress_min_bytes: usize,
}

impl Default for ModuleCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "wfrt".to_string(),
            ttl: Duration::from_secs(3600),
            index_max_age: Duration::from_secs(60),
            compression_level: 3,
            compress_min_bytes: 512,
        }
    }
}

impl ModuleCacheConfig {
    pub fn from_settings(settings: &ModuleCacheSettings, key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            ttl: settings.ttl(),
            index_max_age: settings.index_max_age(),
            compression_level: settings.compression_level,
            compress_min_bytes: settings.compress_min_bytes,
        }
    }
}

/// Hot-tier record; immutable once written for a given hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCacheEntry {
    pub path: String,
    pub content: String,
    pub content_hash: String,
    pub cached_at: DateTime<Utc>,
}

impl ModuleCacheEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            content_hash: sha256_hex(content.as_bytes()),
            content,
            cached_at: Utc::now(),
        }
    }
}

/// Which tier served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Hot,
    Origin,
}

/// Result of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModule {
    pub entry: ModuleCacheEntry,
    pub tier: CacheTier,
}

struct IndexSnapshot {
    paths: HashSet<String>,
    loaded_at: Instant,
}

/// Layered cache distributing versioned source to workers
pub struct ModuleCache {
    store: Arc<dyn CacheStore>,
    origin: Arc<dyn CodeOrigin>,
    keys: Keys,
    config: ModuleCacheConfig,
    codec: EntryCodec,
    index: RwLock<Option<IndexSnapshot>>,
    origin_error_logged: AtomicBool,
}

impl ModuleCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        origin: Arc<dyn CodeOrigin>,
        config: ModuleCacheConfig,
    ) -> Self {
        Self {
            store,
            origin,
            keys: Keys::new(config.key_prefix.clone()),
            codec: EntryCodec::new(config.compression_level, config.compress_min_bytes),
            config,
            index: RwLock::new(None),
            origin_error_logged: AtomicBool::new(false),
        }
    }

    /// Resolve `path` through hot tier then origin
    pub async fn get(&self, path: &str) -> Option<CachedModule> {
        if let Some(entry) = self.read_hot(path).await {
            metrics::counter!("module_cache_lookups_total", "result" => "hot").increment(1);
            return Some(CachedModule {
                entry,
                tier: CacheTier::Hot,
            });
        }

        let bytes = match self.origin.get_object(path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                metrics::counter!("module_cache_lookups_total", "result" => "miss").increment(1);
                return None;
            }
            Err(e) => {
                self.log_origin_error(path, &e);
                metrics::counter!("module_cache_lookups_total", "result" => "error").increment(1);
                return None;
            }
        };

        let content = match String::from_utf8(bytes.to_vec()) {
            Ok(content) => content,
            Err(_) => {
                warn!("Origin object {} is not valid UTF-8 source, ignoring", path);
                return None;
            }
        };

        let entry = ModuleCacheEntry::new(path, content);
        self.write_back(&entry).await;
        metrics::counter!("module_cache_lookups_total", "result" => "origin").increment(1);

        Some(CachedModule {
            entry,
            tier: CacheTier::Origin,
        })
    }

    /// Publish new source for `path` (code-distribution write path).
    ///
    /// Re-pushing identical content is a no-op. Returns the live entry.
    pub async fn push(&self, path: &str, content: &str) -> Result<ModuleCacheEntry> {
        let entry = ModuleCacheEntry::new(path, content);

        if let Some(existing) = self.read_hot(path).await {
            if existing.content_hash == entry.content_hash {
                debug!("Push of {} skipped, hash {} already cached", path, entry.content_hash);
                return Ok(existing);
            }
        }

        let encoded = self.encode(&entry)?;
        self.store
            .set_ex(&self.keys.module(path), encoded, self.config.ttl)
            .await?;
        self.store.sadd(&self.keys.module_index(), path).await?;
        self.remember_indexed(path);
        self.announce_invalidation().await;

        info!("Pushed module {} ({})", path, &entry.content_hash[..12]);
        Ok(entry)
    }

    /// Drop `path` from the hot tier and the index
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.store.del(&self.keys.module(path)).await?;
        self.store.srem(&self.keys.module_index(), path).await?;
        if let Some(snapshot) = self.index.write().as_mut() {
            snapshot.paths.remove(path);
        }
        self.announce_invalidation().await;
        info!("Removed module {}", path);
        Ok(())
    }

    /// Whether `path` is a known module according to the index snapshot
    pub async fn is_indexed(&self, path: &str) -> bool {
        {
            let guard = self.index.read();
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.loaded_at.elapsed() < self.config.index_max_age {
                    return snapshot.paths.contains(path);
                }
            }
        }

        match self.store.smembers(&self.keys.module_index()).await {
            Ok(members) => {
                let paths: HashSet<String> = members.into_iter().collect();
                let known = paths.contains(path);
                debug!("Loaded module index snapshot ({} paths)", paths.len());
                *self.index.write() = Some(IndexSnapshot {
                    paths,
                    loaded_at: Instant::now(),
                });
                known
            }
            Err(e) => {
                // Index unavailable: let the read-through path decide
                warn!("Module index unavailable, falling back to direct lookup: {}", e);
                true
            }
        }
    }

    /// Forget the index snapshot; the next `is_indexed` re-reads the store
    pub fn invalidate_index(&self) {
        *self.index.write() = None;
        debug!("Module index snapshot invalidated");
    }

    /// Every path currently in the index
    pub async fn indexed_paths(&self) -> Result<Vec<String>> {
        let mut paths = self.store.smembers(&self.keys.module_index()).await?;
        paths.sort();
        Ok(paths)
    }

    /// Channel on which pushes announce index changes
    pub fn invalidate_channel(&self) -> String {
        self.keys.module_invalidate_channel()
    }

    /// Drop the index snapshot whenever another process pushes or removes code
    pub async fn watch_invalidations(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let mut messages = self.store.subscribe(&self.invalidate_channel()).await?;
        info!("Watching {} for module index changes", self.invalidate_channel());

        Ok(tokio::spawn(async move {
            while messages.recv().await.is_some() {
                self.invalidate_index();
            }
            debug!("Module invalidation subscription closed");
        }))
    }

    async fn read_hot(&self, path: &str) -> Option<ModuleCacheEntry> {
        let raw = match self.store.get(&self.keys.module(path)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Hot tier read failed for {}: {}", path, e);
                return None;
            }
        };

        match self.decode(&raw) {
            Ok(entry) if entry.path == path => Some(entry),
            Ok(entry) => {
                warn!("Hot tier entry for {} carries path {}, ignoring", path, entry.path);
                None
            }
            Err(e) => {
                warn!("Corrupt hot tier entry for {}: {}", path, e);
                None
            }
        }
    }

    async fn write_back(&self, entry: &ModuleCacheEntry) {
        let encoded = match self.encode(entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode cache entry for {}: {}", entry.path, e);
                return;
            }
        };

        if let Err(e) = self
            .store
            .set_ex(&self.keys.module(&entry.path), encoded, self.config.ttl)
            .await
        {
            warn!("Hot tier write-back failed for {}: {}", entry.path, e);
            return;
        }
        if let Err(e) = self.store.sadd(&self.keys.module_index(), &entry.path).await {
            warn!("Index update failed for {}: {}", entry.path, e);
        }
        self.remember_indexed(&entry.path);
        debug!("Wrote back {} from origin", entry.path);
    }

    fn remember_indexed(&self, path: &str) {
        if let Some(snapshot) = self.index.write().as_mut() {
            snapshot.paths.insert(path.to_string());
        }
    }

    async fn announce_invalidation(&self) {
        let channel = self.keys.module_invalidate_channel();
        if let Err(e) = self.store.publish(&channel, Bytes::from_static(b"invalidate")).await {
            warn!("Failed to announce module index change: {}", e);
        }
    }

    fn log_origin_error(&self, path: &str, error: &EngineError) {
        if !self.origin_error_logged.swap(true, Ordering::Relaxed) {
            warn!("Origin storage error while resolving {}: {}", path, error);
        } else {
            debug!("Origin storage error while resolving {}: {}", path, error);
        }
    }

    fn encode(&self, entry: &ModuleCacheEntry) -> Result<Bytes> {
        self.codec.encode(entry)
    }

    fn decode(&self, raw: &[u8]) -> Result<ModuleCacheEntry> {
        self.codec.decode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::origin::MemoryOrigin;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FailingOrigin;

    #[async_trait]
    impl CodeOrigin for FailingOrigin {
        async fn get_object(&self, _path: &str) -> Result<Option<Bytes>> {
            Err(EngineError::Origin("access denied".to_string()))
        }

        async fn put_object(&self, _path: &str, _data: Bytes) -> Result<()> {
            Err(EngineError::Origin("access denied".to_string()))
        }
    }

    fn cache_with(origin: Arc<dyn CodeOrigin>) -> (ModuleCache, MemoryStore) {
        let store = MemoryStore::new();
        let cache = ModuleCache::new(
            Arc::new(store.clone()),
            origin,
            ModuleCacheConfig::default(),
        );
        (cache, store)
    }

    #[tokio::test]
    async fn test_origin_fallback_writes_back() {
        let origin = MemoryOrigin::new();
        origin
            .put_object("workflows/a.js", Bytes::from_static(b"exports.a = 1;"))
            .await
            .unwrap();
        let (cache, store) = cache_with(Arc::new(origin));

        let first = cache.get("workflows/a.js").await.unwrap();
        assert_eq!(first.tier, CacheTier::Origin);
        assert!(store.sismember("wfrt:module-index", "workflows/a.js").await.unwrap());

        let second = cache.get("workflows/a.js").await.unwrap();
        assert_eq!(second.tier, CacheTier::Hot);
        assert_eq!(second.entry.content, first.entry.content);
        assert_eq!(second.entry.content_hash, first.entry.content_hash);
    }

    #[tokio::test]
    async fn test_origin_miss_is_none() {
        let (cache, store) = cache_with(Arc::new(MemoryOrigin::new()));
        assert!(cache.get("workflows/none.js").await.is_none());
        assert!(store.smembers("wfrt:module-index").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_origin_error_collapses_to_none() {
        let (cache, _) = cache_with(Arc::new(FailingOrigin));
        assert!(cache.get("workflows/a.js").await.is_none());
        assert!(cache.get("workflows/a.js").await.is_none());
    }

    #[tokio::test]
    async fn test_push_then_get_round_trip() {
        let (cache, _) = cache_with(Arc::new(MemoryOrigin::new()));
        let source = "exports.total = (xs) => xs.reduce((a, b) => a + b, 0);";

        let pushed = cache.push("lib/math.js", source).await.unwrap();
        assert_eq!(pushed.content_hash, sha256_hex(source.as_bytes()));

        let fetched = cache.get("lib/math.js").await.unwrap();
        assert_eq!(fetched.entry.content, source);
        assert_eq!(sha256_hex(fetched.entry.content.as_bytes()), pushed.content_hash);
    }

    #[tokio::test]
    async fn test_repush_same_hash_is_noop() {
        let (cache, _) = cache_with(Arc::new(MemoryOrigin::new()));
        let first = cache.push("a.js", "exports.a = 1;").await.unwrap();
        let again = cache.push("a.js", "exports.a = 1;").await.unwrap();
        assert_eq!(first.cached_at, again.cached_at);

        let updated = cache.push("a.js", "exports.a = 2;").await.unwrap();
        assert_ne!(updated.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn test_index_snapshot_needs_invalidation() {
        let store = MemoryStore::new();
        let origin: Arc<dyn CodeOrigin> = Arc::new(MemoryOrigin::new());
        let reader = ModuleCache::new(
            Arc::new(store.clone()),
            origin.clone(),
            ModuleCacheConfig::default(),
        );
        let writer = ModuleCache::new(Arc::new(store.clone()), origin, ModuleCacheConfig::default());

        assert!(!reader.is_indexed("late.js").await);

        writer.push("late.js", "exports.x = 1;").await.unwrap();
        // Snapshot still says no until invalidated
        assert!(!reader.is_indexed("late.js").await);

        reader.invalidate_index();
        assert!(reader.is_indexed("late.js").await);
    }

    #[tokio::test]
    async fn test_push_announces_invalidation() {
        let (cache, store) = cache_with(Arc::new(MemoryOrigin::new()));
        let mut sub = store.subscribe(&cache.invalidate_channel()).await.unwrap();

        cache.push("a.js", "exports.a = 1;").await.unwrap();
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_watch_invalidations_drops_snapshot() {
        let store = MemoryStore::new();
        let origin: Arc<dyn CodeOrigin> = Arc::new(MemoryOrigin::new());
        let reader = Arc::new(ModuleCache::new(
            Arc::new(store.clone()),
            origin.clone(),
            ModuleCacheConfig::default(),
        ));
        let writer = ModuleCache::new(Arc::new(store.clone()), origin, ModuleCacheConfig::default());

        assert!(!reader.is_indexed("pushed.js").await);
        let _watch = reader.clone().watch_invalidations().await.unwrap();

        writer.push("pushed.js", "exports.x = 1;").await.unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if reader.is_indexed("pushed.js").await {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
    }

    #[tokio::test]
    async fn test_remove_drops_entry_and_index() {
        let (cache, _) = cache_with(Arc::new(MemoryOrigin::new()));
        cache.push("a.js", "exports.a = 1;").await.unwrap();
        assert!(cache.is_indexed("a.js").await);

        cache.remove("a.js").await.unwrap();
        assert!(!cache.is_indexed("a.js").await);
        assert!(cache.get("a.js").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_hot_entry_is_a_miss() {
        let origin = MemoryOrigin::new();
        origin.put_object("a.js", Bytes::from_static(b"exports.a = 1;")).await.unwrap();
        let (cache, store) = cache_with(Arc::new(origin));

        store
            .set_ex("wfrt:module:a.js", Bytes::from_static(b"junk"), Duration::from_secs(60))
            .await
            .unwrap();

        let fetched = cache.get("a.js").await.unwrap();
        assert_eq!(fetched.tier, CacheTier::Origin);
        assert_eq!(fetched.entry.content, "exports.a = 1;");
    }
}
