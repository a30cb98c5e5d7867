// src/store/memory.rs
//! In-process cache store
//!
//! Mirrors the subset of Redis semantics the engine relies on: TTLs are
//! honoured lazily on read, sets and hashes are independent keyspaces, and
//! pub/sub fans a message out to every live subscriber of a channel.

use crate::store::{CacheStore, Subscription};
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory store backed by concurrent maps
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, Expiring<Bytes>>>,
    sets: Arc<DashMap<String, HashSet<String>>>,
    hashes: Arc<DashMap<String, Expiring<HashMap<String, String>>>>,
    subscribers: Arc<DashMap<String, Vec<mpsc::Sender<Bytes>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let hit = self
            .values
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());

        if hit.is_none() {
            self.values.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(hit)
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.values.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        self.sets.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let now = Instant::now();
        let mut entry = self.hashes.entry(key.to_string()).or_insert_with(|| Expiring {
            value: HashMap::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.value.clear();
            entry.expires_at = None;
        }
        for (field, value) in fields {
            entry.value.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        Ok(self
            .hashes
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let at = Some(Instant::now() + ttl);
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = at;
        }
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.expires_at = at;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        if let Some(mut subs) = self.subscribers.get_mut(channel) {
            subs.retain(|sub| !sub.is_closed());
            for sub in subs.iter() {
                if sub.try_send(payload.clone()).is_err() {
                    warn!("Subscriber on {} lagging, message dropped", channel);
                }
            }
            debug!("Published {} bytes to {} ({} subscribers)", payload.len(), channel, subs.len());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
