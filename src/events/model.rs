// src/events/model.rs
//! Event pipeline records
//!
//! ```text
//! EventSource ──fires──▶ Event ──fans out──▶ EventDelivery (one per subscription)
//!      ▲                                          │
//!      └── EventSubscription ── workflow_id ──────┘
//! ```

use crate::runtime::protocol::WorkflowRef;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Unix milliseconds, the storage representation of every timestamp
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Schedule,
    Webhook,
}

string_enum!(SourceType { Schedule => "SCHEDULE", Webhook => "WEBHOOK" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Processing,
    Completed,
    Failed,
}

string_enum!(EventStatus {
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// Delivery lifecycle
///
/// `FAILED` means the last attempt failed and a retry is scheduled at
/// `next_retry_at`; `SUCCEEDED` and `DEAD` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Dead,
}

string_enum!(DeliveryStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
    Dead => "DEAD",
});

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Succeeded | DeliveryStatus::Dead)
    }
}

/// A runnable workflow: module by logical path plus its entry function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub logical_path: String,
    pub entry_symbol: String,
    pub is_active: bool,
}

impl Workflow {
    pub fn new(name: &str, logical_path: &str, entry_symbol: &str) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.to_string(),
            logical_path: logical_path.to_string(),
            entry_symbol: entry_symbol.to_string(),
            is_active: true,
        }
    }

    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(self.logical_path.clone(), self.entry_symbol.clone())
    }
}

/// Type-specific config of a SCHEDULE source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub cron: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,

    /// Type-specific configuration ([`ScheduleConfig`] for schedules)
    pub config: Value,

    pub is_active: bool,

    /// Most recent occurrence an Event was created for
    pub last_scheduled_for: Option<DateTime<Utc>>,

    /// Latest evaluation diagnostic, cleared on the next good evaluation
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl EventSource {
    pub fn schedule(name: &str, cron: &str, timezone: &str) -> Self {
        Self::new(
            name,
            SourceType::Schedule,
            serde_json::json!({"cron": cron, "timezone": timezone, "enabled": true}),
        )
    }

    pub fn webhook(name: &str) -> Self {
        Self::new(name, SourceType::Webhook, serde_json::json!({}))
    }

    fn new(name: &str, source_type: SourceType, config: Value) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.to_string(),
            source_type,
            config,
            is_active: true,
            last_scheduled_for: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig> {
        if self.source_type != SourceType::Schedule {
            return Err(EngineError::InvalidSchedule(format!(
                "source {} is a {} source",
                self.id, self.source_type
            )));
        }
        serde_json::from_value(self.config.clone())
            .map_err(|e| EngineError::InvalidSchedule(format!("source {}: {}", self.id, e)))
    }
}

/// Binds a workflow to a source, optionally filtered by event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: String,
    pub event_source_id: String,
    pub workflow_id: String,

    /// Only events of this type are delivered; `None` matches every event
    pub event_type: Option<String>,

    pub is_active: bool,
}

impl EventSubscription {
    pub fn new(event_source_id: &str, workflow_id: &str) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            event_source_id: event_source_id.to_string(),
            workflow_id: workflow_id.to_string(),
            event_type: None,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_source_id: String,
    pub event_type: String,
    pub data: Value,
    pub status: EventStatus,
    pub received_at: DateTime<Utc>,
}

/// Input to the transactional fan-out
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_source_id: String,
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: String,
    pub event_id: String,
    pub event_subscription_id: String,
    pub workflow_id: String,
    pub status: DeliveryStatus,

    /// Attempts finished so far; never decreases
    pub attempt_count: u32,

    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An Event together with the deliveries created for it
#[derive(Debug, Clone, PartialEq)]
pub struct FanOut {
    pub event: Event,
    pub deliveries: Vec<EventDelivery>,
}

/// Delivery counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: DeliveryStatus, count: u64) {
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Running => self.running += count,
            DeliveryStatus::Succeeded => self.succeeded += count,
            DeliveryStatus::Failed => self.failed += count,
            DeliveryStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.succeeded + self.failed + self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Running,
            DeliveryStatus::Succeeded,
            DeliveryStatus::Failed,
            DeliveryStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert!("LOST".parse::<DeliveryStatus>().is_err());
        assert!(DeliveryStatus::Dead.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn test_schedule_config_defaults() {
        let mut source = EventSource::schedule("nightly", "0 3 * * *", "UTC");
        source.config = serde_json::json!({"cron": "0 3 * * *"});
        let config = source.schedule_config().unwrap();
        assert_eq!(config.timezone, "UTC");
        assert!(config.enabled);

        assert!(EventSource::webhook("hook").schedule_config().is_err());
    }

    #[test]
    fn test_millis_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(from_millis(to_millis(at)), at);
    }
}
