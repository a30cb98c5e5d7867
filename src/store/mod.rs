// src/store/mod.rs
//! Shared cache/queue store (Redis-like)
//!
//! Everything that coordinates across hosts goes through this trait: the
//! module hot tier, the module index, pool registration, heartbeats and the
//! recycle command channel. Two implementations are provided:
//!
//! - **RedisStore**: production backend over a multiplexed async connection
//! - **MemoryStore**: in-process backend for tests and single-host runs
//!
//! Handles are constructed once at startup and passed down explicitly.

pub mod memory;
pub mod redis_store;

use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Stream of messages received on a subscribed channel
pub type Subscription = mpsc::Receiver<Bytes>;

/// Redis-like key/value, set, hash and pub/sub operations
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// GET
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// SETEX (single atomic write with TTL)
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// DEL
    async fn del(&self, key: &str) -> Result<()>;

    /// SADD
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// SREM
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// SMEMBERS
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// SISMEMBER
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// HSET with every field of `fields`
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// HGETALL
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// EXPIRE
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// PUBLISH
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// SUBSCRIBE; messages arrive on the returned receiver until it is dropped
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Key and channel naming under a common prefix
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn module(&self, path: &str) -> String {
        format!("{}:module:{}", self.prefix, path)
    }

    pub fn module_index(&self) -> String {
        format!("{}:module-index", self.prefix)
    }

    pub fn module_invalidate_channel(&self) -> String {
        format!("{}:module-invalidate", self.prefix)
    }

    pub fn pools(&self) -> String {
        format!("{}:pools", self.prefix)
    }

    pub fn pool(&self, worker_id: &str) -> String {
        format!("{}:pool:{}", self.prefix, worker_id)
    }

    pub fn pool_heartbeat(&self, worker_id: &str) -> String {
        format!("{}:pool:{}:heartbeat", self.prefix, worker_id)
    }

    pub fn heartbeat_channel(&self) -> String {
        format!("{}:pool:heartbeat", self.prefix)
    }

    pub fn command_channel(&self, worker_id: &str) -> String {
        format!("{}:pool:{}:commands", self.prefix, worker_id)
    }

    pub fn command_results_channel(&self) -> String {
        format!("{}:pool:command-results", self.prefix)
    }

    pub fn alerts_channel(&self) -> String {
        format!("{}:alerts", self.prefix)
    }
}

/// Open the store named by `url`; `memory://` yields an in-process store
pub async fn connect(url: &str) -> Result<Arc<dyn CacheStore>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(RedisStore::connect(url).await?))
}
