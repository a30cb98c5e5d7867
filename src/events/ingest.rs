// src/events/ingest.rs
//! Inbound webhook events

use crate::events::model::{FanOut, NewEvent, SourceType};
use crate::events::storage::EventStore;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use tracing::info;

/// Event type used when the caller does not name one
pub const DEFAULT_WEBHOOK_EVENT: &str = "webhook.received";

#[derive(Clone)]
pub struct EventIngestor {
    store: EventStore,
}

impl EventIngestor {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Record an inbound event for an active WEBHOOK source and fan it out
    pub async fn ingest_webhook(
        &self,
        source_id: &str,
        event_type: Option<&str>,
        data: Value,
    ) -> Result<FanOut> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event source {}", source_id)))?;

        if source.source_type != SourceType::Webhook {
            return Err(EngineError::RuntimeError(format!(
                "event source {} is a {} source",
                source_id, source.source_type
            )));
        }
        if !source.is_active {
            return Err(EngineError::RuntimeError(format!(
                "event source {} is inactive",
                source_id
            )));
        }

        let event = NewEvent {
            event_source_id: source.id,
            event_type: event_type.unwrap_or(DEFAULT_WEBHOOK_EVENT).to_string(),
            data,
        };
        let fan_out = self
            .store
            .fan_out(event, None)
            .await?
            .ok_or_else(|| EngineError::StorageFailed("webhook event was not recorded".to_string()))?;

        info!(
            "Webhook event {} ({}) on source {} fanned out to {} deliveries",
            fan_out.event.id,
            fan_out.event.event_type,
            source_id,
            fan_out.deliveries.len()
        );
        metrics::counter!("webhook_events_total").increment(1);
        Ok(fan_out)
    }
}
