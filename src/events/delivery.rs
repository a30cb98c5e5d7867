// src/events/delivery.rs
//! Delivery queue processor
//!
//! One pass:
//!
//! ```text
//! stale RUNNING (older than running_timeout) ─▶ failed attempt
//! claimable (PENDING, or FAILED with a due retry) ─▶ CAS to RUNNING
//!     └─▶ executor.execute(workflow, payload)   (up to `concurrency` at once)
//!           ├─ success ─▶ SUCCEEDED
//!           └─ failure ─▶ FAILED + next_retry_at, or DEAD at the ceiling
//! ```
//!
//! Only deliveries this processor moved to RUNNING are written back, so
//! several processors can share one database.

use crate::alerts::{AlertKind, AlertPublisher, Severity};
use crate::events::backoff::{RetryDecision, RetryPolicy};
use crate::events::model::{DeliveryStatus, EventDelivery};
use crate::events::storage::EventStore;
use crate::runtime::pool::WorkflowExecutor;
use crate::utils::config::DeliverySettings;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Deliveries claimed per pass
    pub batch_size: usize,

    /// Executions in flight per pass
    pub concurrency: usize,

    pub poll_interval: Duration,

    /// RUNNING deliveries older than this belong to a dead processor
    pub running_timeout: Duration,
}

impl DeliveryConfig {
    pub fn from_settings(settings: &DeliverySettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            concurrency: settings.concurrency.max(1),
            poll_interval: settings.poll_interval(),
            running_timeout: Duration::from_secs(settings.running_timeout_secs),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from_settings(&DeliverySettings::default())
    }
}

/// Counters of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead: usize,
}

impl PassReport {
    fn record(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Succeeded => self.succeeded += 1,
            DeliveryStatus::Failed => self.retried += 1,
            DeliveryStatus::Dead => self.dead += 1,
            _ => {}
        }
    }
}

pub struct DeliveryProcessor {
    store: EventStore,
    executor: Arc<dyn WorkflowExecutor>,
    policy: RetryPolicy,
    config: DeliveryConfig,
    alerts: AlertPublisher,
}

impl DeliveryProcessor {
    pub fn new(
        store: EventStore,
        executor: Arc<dyn WorkflowExecutor>,
        policy: RetryPolicy,
        config: DeliveryConfig,
        alerts: AlertPublisher,
    ) -> Self {
        Self {
            store,
            executor,
            policy,
            config,
            alerts,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reclaim, claim and process one batch as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();

        let cutoff = now
            - chrono::Duration::from_std(self.config.running_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));
        for delivery in self.store.stale_running(cutoff).await? {
            warn!(
                "Delivery {} stuck in RUNNING since {:?}, counting the attempt as failed",
                delivery.id, delivery.started_at
            );
            match self
                .record_failure(&delivery, "Delivery abandoned while RUNNING", now)
                .await
            {
                Ok(status) => {
                    report.reclaimed += 1;
                    report.record(status);
                }
                Err(e) => error!("Failed to reclaim delivery {}: {}", delivery.id, e),
            }
        }

        let mut claimed = Vec::new();
        for delivery in self.store.claimable(now, self.config.batch_size).await? {
            if self.store.try_claim(&delivery.id, delivery.status, now).await? {
                claimed.push(delivery);
            } else {
                debug!("Delivery {} claimed elsewhere", delivery.id);
            }
        }
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<(String, Result<DeliveryStatus>)> = stream::iter(claimed)
            .map(|delivery| async move {
                let outcome = self.process(&delivery, now).await;
                (delivery.id, outcome)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (delivery_id, outcome) in outcomes {
            match outcome {
                Ok(status) => report.record(status),
                Err(e) => error!("Failed to record outcome of delivery {}: {}", delivery_id, e),
            }
        }

        debug!(
            "Delivery pass: {} claimed, {} succeeded, {} retrying, {} dead, {} reclaimed",
            report.claimed, report.succeeded, report.retried, report.dead, report.reclaimed
        );
        Ok(report)
    }

    /// Run one claimed delivery and write its outcome
    async fn process(&self, delivery: &EventDelivery, now: DateTime<Utc>) -> Result<DeliveryStatus> {
        let started = Instant::now();
        let workflow = match self.store.get_workflow(&delivery.workflow_id).await? {
            Some(workflow) if workflow.is_active => workflow,
            Some(_) => {
                let message = format!("Workflow {} is inactive", delivery.workflow_id);
                return self.record_failure(delivery, &message, now).await;
            }
            None => {
                let message = format!("Workflow {} not found", delivery.workflow_id);
                return self.record_failure(delivery, &message, now).await;
            }
        };
        let event = match self.store.get_event(&delivery.event_id).await? {
            Some(event) => event,
            None => {
                let message = format!("Event {} not found", delivery.event_id);
                return self.record_failure(delivery, &message, now).await;
            }
        };

        let attempt = delivery.attempt_count + 1;
        let payload = json!({
            "event_id": event.id,
            "event_type": event.event_type,
            "event_source_id": event.event_source_id,
            "delivery_id": delivery.id,
            "attempt": attempt,
            "data": event.data,
        });

        debug!(
            "Delivering {} to workflow {} (attempt {})",
            delivery.id, workflow.name, attempt
        );
        let result = self.executor.execute(&workflow.workflow_ref(), payload).await;
        metrics::histogram!("delivery_duration_seconds").record(started.elapsed().as_secs_f64());

        if result.is_success() {
            let value = result.result.unwrap_or(Value::Null);
            self.store
                .complete_delivery(&delivery.id, &value, finished_at(now))
                .await?;
            metrics::counter!("deliveries_total", "status" => "succeeded").increment(1);
            info!(
                "Delivery {} succeeded on attempt {} ({}ms)",
                delivery.id, attempt, result.duration_ms
            );
            return Ok(DeliveryStatus::Succeeded);
        }

        let message = match &result.error {
            Some(error) => error.to_string(),
            None => format!("Execution ended with status {}", result.status.as_str()),
        };
        self.record_failure(delivery, &message, now).await
    }

    /// Close a RUNNING attempt as failed: retry later, or DEAD at the ceiling
    async fn record_failure(
        &self,
        delivery: &EventDelivery,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        let failed_at = finished_at(now);
        let attempts = delivery.attempt_count + 1;
        let next_retry_at = match self.policy.decide(attempts, failed_at) {
            RetryDecision::Retry { at } => Some(at),
            RetryDecision::Dead => None,
        };

        let status = self
            .store
            .fail_delivery(&delivery.id, message, next_retry_at, failed_at)
            .await?;

        match status {
            DeliveryStatus::Dead => {
                metrics::counter!("deliveries_total", "status" => "dead").increment(1);
                self.alerts
                    .raise(
                        AlertKind::DeliveryDead,
                        Severity::Critical,
                        format!(
                            "Delivery {} is dead after {} attempts: {}",
                            delivery.id, attempts, message
                        ),
                        json!({
                            "delivery_id": delivery.id,
                            "event_id": delivery.event_id,
                            "workflow_id": delivery.workflow_id,
                            "attempts": attempts,
                        }),
                    )
                    .await;
            }
            _ => {
                metrics::counter!("deliveries_total", "status" => "failed").increment(1);
                warn!(
                    "Delivery {} failed on attempt {}, retrying at {:?}: {}",
                    delivery.id, attempts, next_retry_at, message
                );
            }
        }
        Ok(status)
    }

    /// Poll until `shutdown` flips; a full batch polls again immediately
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Delivery processor started (batch {}, concurrency {})",
                self.config.batch_size, self.config.concurrency
            );
            loop {
                let busy = match self.run_once(Utc::now()).await {
                    Ok(report) => report.claimed >= self.config.batch_size,
                    Err(e) => {
                        error!("Delivery pass failed: {}", e);
                        false
                    }
                };
                if *shutdown.borrow() {
                    break;
                }
                if busy {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("Delivery processor stopped");
        })
    }
}

/// Attempt bookkeeping never runs behind the pass clock
fn finished_at(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(now)
}
