// src/alerts.rs
//! Operator-facing alerts
//!
//! Structural problems (boundary violations, dead deliveries, a pool that
//! cannot reach its minimum size) are logged and published on
//! `{prefix}:alerts` for whatever notification service is listening.

use crate::store::{CacheStore, Keys};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PoolBelowMinimum,
    ProcessCrashed,
    ImportBoundaryViolation,
    DeliveryDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,

    /// Component raising the alert (pool worker id, "delivery", ...)
    pub source: String,

    #[serde(default)]
    pub context: Value,

    pub raised_at: DateTime<Utc>,
}

/// Publishes alerts on the shared store
#[derive(Clone)]
pub struct AlertPublisher {
    store: Arc<dyn CacheStore>,
    channel: String,
    source: String,
}

impl AlertPublisher {
    pub fn new(store: Arc<dyn CacheStore>, keys: &Keys, source: impl Into<String>) -> Self {
        Self {
            store,
            channel: keys.alerts_channel(),
            source: source.into(),
        }
    }

    pub async fn raise(
        &self,
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
        context: Value,
    ) {
        let alert = Alert {
            kind,
            severity,
            message: message.into(),
            source: self.source.clone(),
            context,
            raised_at: Utc::now(),
        };

        match severity {
            Severity::Critical => error!("ALERT {:?} from {}: {}", kind, alert.source, alert.message),
            Severity::Warning => warn!("ALERT {:?} from {}: {}", kind, alert.source, alert.message),
        }
        metrics::counter!("alerts_raised_total").increment(1);

        let payload = match serde_json::to_vec(&alert) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode alert: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.channel, Bytes::from(payload)).await {
            warn!("Failed to publish alert on {}: {}", self.channel, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_alert_published() {
        let store = MemoryStore::new();
        let keys = Keys::new("wfrt");
        let mut alerts = store.subscribe(&keys.alerts_channel()).await.unwrap();

        let publisher = AlertPublisher::new(Arc::new(store.clone()), &keys, "delivery");
        publisher
            .raise(
                AlertKind::DeliveryDead,
                Severity::Critical,
                "delivery d1 is dead",
                json!({"delivery_id": "d1"}),
            )
            .await;

        let raw = alerts.recv().await.unwrap();
        let alert: Alert = serde_json::from_slice(&raw).unwrap();
        assert_eq!(alert.kind, AlertKind::DeliveryDead);
        assert_eq!(alert.source, "delivery");
        assert_eq!(alert.context["delivery_id"], "d1");
    }
}
