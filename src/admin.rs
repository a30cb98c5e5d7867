// src/admin.rs
//! Operator views over the shared store and the event database
//!
//! Read-only apart from [`AdminClient::request_recycle`], which only publishes
//! a command; the owning pool decides whether to apply it.

use crate::events::model::QueueStats;
use crate::events::storage::EventStore;
use crate::runtime::pool::{Heartbeat, PoolCommand, PoolRecord};
use crate::store::{CacheStore, Keys};
use crate::utils::errors::Result;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AdminClient {
    store: Arc<dyn CacheStore>,
    keys: Keys,
    events: Option<EventStore>,
}

impl AdminClient {
    pub fn new(store: Arc<dyn CacheStore>, key_prefix: &str, events: Option<EventStore>) -> Self {
        Self {
            store,
            keys: Keys::new(key_prefix),
            events,
        }
    }

    /// Registered pools; stale set members whose hash expired are skipped
    pub async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let mut worker_ids = self.store.smembers(&self.keys.pools()).await?;
        worker_ids.sort();

        let mut records = Vec::with_capacity(worker_ids.len());
        for worker_id in worker_ids {
            let fields = self.store.hgetall(&self.keys.pool(&worker_id)).await?;
            match PoolRecord::from_fields(&fields) {
                Some(record) => records.push(record),
                None => warn!("Pool {} is registered but has no readable record", worker_id),
            }
        }
        Ok(records)
    }

    pub async fn latest_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>> {
        match self.store.get(&self.keys.pool_heartbeat(worker_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delivery counts by status, when an event database is attached
    pub async fn queue_stats(&self) -> Result<Option<QueueStats>> {
        match &self.events {
            Some(events) => Ok(Some(events.queue_stats().await?)),
            None => Ok(None),
        }
    }

    /// Publish a recycle command to `worker_id`'s command channel
    pub async fn request_recycle(
        &self,
        worker_id: &str,
        pid: Option<u32>,
        process_id: Option<String>,
        reason: Option<String>,
    ) -> Result<()> {
        let command = PoolCommand::RecycleProcess {
            pid,
            process_id,
            reason,
        };
        let payload = serde_json::to_vec(&command)?;
        self.store
            .publish(&self.keys.command_channel(worker_id), Bytes::from(payload))
            .await?;
        info!("Requested recycle on pool {}: {:?}", worker_id, command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::{PoolConfig, ProcessPool, RecycleOutcome};
    use crate::runtime::process_manager::WorkerHandle;
    use crate::runtime::resource_limiter::ResourceLimits;
    use crate::runtime::testing::FakeLauncher;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn pool_config(worker_id: &str) -> PoolConfig {
        PoolConfig {
            worker_id: worker_id.to_string(),
            key_prefix: "wfrt".to_string(),
            min_workers: 1,
            max_workers: 2,
            execution_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_millis(50),
            limits: ResourceLimits::unlimited(),
        }
    }

    #[tokio::test]
    async fn test_lists_pools_and_heartbeats() {
        let store = MemoryStore::new();
        let pool = ProcessPool::new(
            pool_config("pool-a"),
            Arc::new(FakeLauncher::echo()),
            Arc::new(store.clone()),
        );
        pool.start().await.unwrap();

        let admin = AdminClient::new(Arc::new(store.clone()), "wfrt", None);
        let pools = admin.list_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].worker_id, "pool-a");

        let heartbeat = admin.latest_heartbeat("pool-a").await.unwrap().unwrap();
        assert_eq!(heartbeat.pool_size, 1);
        assert!(admin.latest_heartbeat("pool-b").await.unwrap().is_none());
        assert!(admin.queue_stats().await.unwrap().is_none());

        pool.shutdown().await;
        assert!(admin.list_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_recycle_publishes_command() {
        let store = MemoryStore::new();
        let keys = Keys::new("wfrt");
        let mut commands = store.subscribe(&keys.command_channel("pool-a")).await.unwrap();

        let admin = AdminClient::new(Arc::new(store.clone()), "wfrt", None);
        admin
            .request_recycle("pool-a", Some(4242), None, Some("leak".to_string()))
            .await
            .unwrap();

        let command: PoolCommand = serde_json::from_slice(&commands.recv().await.unwrap()).unwrap();
        assert_eq!(
            command,
            PoolCommand::RecycleProcess {
                pid: Some(4242),
                process_id: None,
                reason: Some("leak".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_recycle_reaches_pool() {
        let store = MemoryStore::new();
        let launcher = Arc::new(FakeLauncher::echo());
        let pool = ProcessPool::new(pool_config("pool-r"), launcher.clone(), Arc::new(store.clone()));
        pool.start().await.unwrap();
        let mut results = store
            .subscribe(&Keys::new("wfrt").command_results_channel())
            .await
            .unwrap();

        let pid = launcher.launched()[0].pid();
        let admin = AdminClient::new(Arc::new(store.clone()), "wfrt", None);
        admin.request_recycle("pool-r", Some(pid), None, None).await.unwrap();

        let result: crate::runtime::pool::CommandResult =
            serde_json::from_slice(&results.recv().await.unwrap()).unwrap();
        assert_eq!(result.outcome, RecycleOutcome::Recycled);
        assert_eq!(pool.stats().live, 1);
        pool.shutdown().await;
    }
}
