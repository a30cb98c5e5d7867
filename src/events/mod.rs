// src/events/mod.rs
//! Scheduling and event delivery
//!
//! - **Scheduler**: evaluates cron sources each tick and creates events
//! - **Ingest**: records inbound webhook events
//! - **Storage**: SQLite tables for workflows, sources, subscriptions, events and deliveries
//! - **Delivery**: claims deliveries and runs them on a [`WorkflowExecutor`](crate::runtime::WorkflowExecutor)
//!
//! ```text
//! Scheduler ─┐
//!            ├─▶ Event ─▶ EventDelivery × subscriptions ─▶ DeliveryProcessor ─▶ ProcessPool
//! Webhook ───┘
//! ```

pub mod backoff;
pub mod crontab;
pub mod delivery;
pub mod ingest;
pub mod model;
pub mod scheduler;
pub mod storage;

pub use backoff::{RetryDecision, RetryPolicy};
pub use crontab::CronSchedule;
pub use delivery::{DeliveryConfig, DeliveryProcessor, PassReport};
pub use ingest::EventIngestor;
pub use model::{
    DeliveryStatus, Event, EventDelivery, EventSource, EventStatus, EventSubscription, FanOut,
    NewEvent, QueueStats, ScheduleConfig, SourceType, Workflow,
};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use storage::EventStore;
