// tests/pipeline.rs
//! Schedule tick → event fan-out → delivery → pooled execution, end to end
//! with in-process fake workers.

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use workflow_runtime::alerts::AlertPublisher;
use workflow_runtime::events::{
    DeliveryConfig, DeliveryProcessor, DeliveryStatus, EventIngestor, EventSource, EventStatus,
    EventStore, EventSubscription, RetryPolicy, Scheduler, SchedulerConfig, Workflow,
};
use workflow_runtime::runtime::protocol::ExecutionError;
use workflow_runtime::runtime::resource_limiter::ResourceLimits;
use workflow_runtime::runtime::testing::{FakeBehavior, FakeLauncher, Script};
use workflow_runtime::runtime::{PoolConfig, ProcessPool};
use workflow_runtime::store::{Keys, MemoryStore};

fn pool_config() -> PoolConfig {
    PoolConfig {
        worker_id: "pool-it".to_string(),
        key_prefix: "wfrt".to_string(),
        min_workers: 2,
        max_workers: 4,
        execution_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(50),
        limits: ResourceLimits::unlimited(),
    }
}

fn processor(events: &EventStore, pool: Arc<ProcessPool>, cache: &MemoryStore) -> DeliveryProcessor {
    DeliveryProcessor::new(
        events.clone(),
        pool,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: false,
        },
        DeliveryConfig {
            batch_size: 8,
            concurrency: 4,
            poll_interval: Duration::from_millis(10),
            running_timeout: Duration::from_secs(900),
        },
        AlertPublisher::new(Arc::new(cache.clone()), &Keys::new("wfrt"), "delivery"),
    )
}

#[tokio::test]
async fn test_schedule_fires_and_workflows_run() {
    let events = EventStore::open_in_memory().await.unwrap();
    let report = Workflow::new("report", "workflows/report.js", "run");
    let audit = Workflow::new("audit", "workflows/audit.js", "run");
    events.upsert_workflow(&report).await.unwrap();
    events.upsert_workflow(&audit).await.unwrap();

    let source = EventSource::schedule("every-five", "*/5 * * * *", "UTC");
    events.create_source(&source).await.unwrap();
    for workflow in [&report, &audit] {
        events
            .create_subscription(&EventSubscription::new(&source.id, &workflow.id))
            .await
            .unwrap();
    }

    let cache = MemoryStore::new();
    let launcher = Arc::new(FakeLauncher::echo());
    let pool = ProcessPool::new(pool_config(), launcher.clone(), Arc::new(cache.clone()));
    pool.start().await.unwrap();

    let scheduler = Scheduler::new(
        events.clone(),
        SchedulerConfig {
            tick_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(300),
        },
    );
    let tick_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 10).unwrap();
    assert_eq!(scheduler.tick_at(tick_at).await.unwrap().fired, 1);

    let processor = processor(&events, pool.clone(), &cache);
    let pass = processor.run_once(Utc::now()).await.unwrap();
    assert_eq!(pass.claimed, 2);
    assert_eq!(pass.succeeded, 2);

    let fired = events.events_for_source(&source.id).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].status, EventStatus::Completed);

    for delivery in events.deliveries_for_event(&fired[0].id).await.unwrap() {
        assert_eq!(delivery.status, DeliveryStatus::Succeeded);
        let echoed = delivery.result.unwrap();
        assert_eq!(echoed["event_type"], json!("schedule.fired"));
        assert_eq!(echoed["delivery_id"], json!(delivery.id));
        assert_eq!(echoed["attempt"], json!(1));
        assert_eq!(echoed["data"]["cron"], json!("*/5 * * * *"));
    }

    let stats = events.queue_stats().await.unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(pool.stats().live, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_webhook_failure_retries_then_dies() {
    let events = EventStore::open_in_memory().await.unwrap();
    let workflow = Workflow::new("flaky", "workflows/flaky.js", "run");
    events.upsert_workflow(&workflow).await.unwrap();
    let source = EventSource::webhook("partner");
    events.create_source(&source).await.unwrap();
    events
        .create_subscription(&EventSubscription::new(&source.id, &workflow.id))
        .await
        .unwrap();

    let cache = MemoryStore::new();
    let script: Script = Arc::new(|_| {
        FakeBehavior::Fail(ExecutionError::new("KeyError", "'customer'"))
    });
    let pool = ProcessPool::new(pool_config(), Arc::new(FakeLauncher::new(script)), Arc::new(cache.clone()));
    pool.start().await.unwrap();

    let fan_out = EventIngestor::new(events.clone())
        .ingest_webhook(&source.id, Some("invoice.paid"), json!({"invoice": 9}))
        .await
        .unwrap();
    let delivery_id = fan_out.deliveries[0].id.clone();

    let processor = processor(&events, pool.clone(), &cache);
    let mut clock = Utc::now();
    let mut attempts = Vec::new();
    loop {
        let pass = processor.run_once(clock).await.unwrap();
        if pass.claimed == 0 {
            break;
        }
        let delivery = events.get_delivery(&delivery_id).await.unwrap().unwrap();
        attempts.push(delivery.attempt_count);
        match delivery.next_retry_at {
            Some(at) => clock = at + chrono::Duration::seconds(1),
            None => break,
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);

    let delivery = events.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Dead);
    assert!(delivery.next_retry_at.is_none());
    assert_eq!(delivery.last_error.as_deref(), Some("KeyError: 'customer'"));

    let event = events.get_event(&fan_out.event.id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    pool.shutdown().await;
}
