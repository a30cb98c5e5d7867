// src/events/scheduler.rs
//! Cron scheduler
//!
//! Every tick, each active SCHEDULE source is evaluated independently:
//!
//! ```text
//! source ─▶ parse cron/timezone ─▶ occurrence in (now - tick, now]? ─▶ fan_out (one transaction)
//!              │ invalid                 │ none / already recorded
//!              ▼                         ▼
//!         last_error + warn            skip
//! ```
//!
//! Occurrences missed while the scheduler was down are dropped; only the most
//! recent occurrence inside the window fires.

use crate::events::crontab::CronSchedule;
use crate::events::model::{EventSource, NewEvent, SourceType};
use crate::events::storage::EventStore;
use crate::utils::config::SchedulerSettings;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event type of schedule firings
pub const SCHEDULE_FIRED: &str = "schedule.fired";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period, also the polling window
    pub tick_interval: Duration,

    /// Schedules firing more often than this are warned about
    pub min_interval: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            min_interval: Duration::from_secs(settings.min_interval_secs),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

/// Result of evaluating one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Fired { event_id: String, deliveries: usize },
    NoMatch,
    AlreadyFired,
    Disabled,
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub fired: usize,
    pub invalid: usize,
    pub errors: usize,
}

pub struct Scheduler {
    store: EventStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: EventStore, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate every active schedule source against `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let sources = self.store.active_sources(SourceType::Schedule).await?;
        let mut report = TickReport::default();

        for source in sources {
            report.evaluated += 1;
            match self.evaluate_source(&source, now).await {
                Ok(SourceOutcome::Fired { .. }) => report.fired += 1,
                Ok(SourceOutcome::Invalid(_)) => report.invalid += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!("Failed to evaluate schedule source {} ({}): {}", source.id, source.name, e);
                }
            }
        }

        metrics::counter!("scheduler_ticks_total").increment(1);
        metrics::counter!("scheduler_events_fired_total").increment(report.fired as u64);
        debug!(
            "Scheduler tick at {}: {} sources, {} fired, {} invalid, {} errors",
            now, report.evaluated, report.fired, report.invalid, report.errors
        );
        Ok(report)
    }

    pub async fn evaluate_source(
        &self,
        source: &EventSource,
        now: DateTime<Utc>,
    ) -> Result<SourceOutcome> {
        let parsed = source
            .schedule_config()
            .and_then(|config| CronSchedule::parse(&config.cron, &config.timezone).map(|c| (config, c)));
        let (config, cron) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                let message = e.to_string();
                warn!("Skipping schedule source {} ({}): {}", source.id, source.name, message);
                if source.last_error.as_deref() != Some(message.as_str()) {
                    self.store.record_source_error(&source.id, Some(&message)).await?;
                }
                return Ok(SourceOutcome::Invalid(message));
            }
        };

        if source.last_error.is_some() {
            self.store.record_source_error(&source.id, None).await?;
        }
        if !config.enabled {
            return Ok(SourceOutcome::Disabled);
        }

        let window = chrono::Duration::from_std(self.config.tick_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let occurrence = match cron.fires_in_window(now, window) {
            Some(occurrence) => occurrence,
            None => return Ok(SourceOutcome::NoMatch),
        };
        if source.last_scheduled_for.is_some_and(|last| last >= occurrence) {
            return Ok(SourceOutcome::AlreadyFired);
        }

        if let Some(last) = source.last_scheduled_for {
            let missed = cron.count_between(last, occurrence);
            if missed > 0 {
                warn!(
                    "Schedule source {} missed {} occurrences between {} and {}, not replaying",
                    source.id, missed, last, occurrence
                );
                metrics::counter!("scheduler_missed_fires_total").increment(missed as u64);
            }
        }
        if let Some(gap) = cron.gap_after(occurrence) {
            if gap.to_std().is_ok_and(|gap| gap < self.config.min_interval) {
                warn!(
                    "Schedule source {} ('{}') fires every {}s, below the {}s minimum",
                    source.id,
                    cron.expression(),
                    gap.num_seconds(),
                    self.config.min_interval.as_secs()
                );
            }
        }

        let event = NewEvent {
            event_source_id: source.id.clone(),
            event_type: SCHEDULE_FIRED.to_string(),
            data: json!({
                "scheduled_for": occurrence.to_rfc3339(),
                "cron": config.cron,
                "timezone": config.timezone,
            }),
        };
        match self.store.fan_out(event, Some(occurrence)).await? {
            Some(fan_out) => {
                info!(
                    "Schedule source {} fired for {}: event {} with {} deliveries",
                    source.id,
                    occurrence,
                    fan_out.event.id,
                    fan_out.deliveries.len()
                );
                Ok(SourceOutcome::Fired {
                    event_id: fan_out.event.id,
                    deliveries: fan_out.deliveries.len(),
                })
            }
            None => Ok(SourceOutcome::AlreadyFired),
        }
    }

    /// Tick until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler started (tick {:?})", self.config.tick_interval);
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{DeliveryStatus, EventStatus, EventSubscription, Workflow};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    async fn setup(cron: &str, subscribers: usize) -> (Scheduler, EventStore, EventSource) {
        let store = EventStore::open_in_memory().await.unwrap();
        let workflow = Workflow::new("digest", "workflows/digest.js", "run");
        store.upsert_workflow(&workflow).await.unwrap();
        let source = EventSource::schedule("every-five", cron, "UTC");
        store.create_source(&source).await.unwrap();
        for _ in 0..subscribers {
            store
                .create_subscription(&EventSubscription::new(&source.id, &workflow.id))
                .await
                .unwrap();
        }
        let scheduler = Scheduler::new(
            store.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_secs(60),
                min_interval: Duration::from_secs(300),
            },
        );
        (scheduler, store, source)
    }

    #[tokio::test]
    async fn test_fires_only_inside_window() {
        let (scheduler, store, source) = setup("*/5 * * * *", 1).await;

        // previous fire 3 minutes ago
        let report = scheduler.tick_at(at(12, 8, 0)).await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.fired, 0);
        assert!(store.events_for_source(&source.id).await.unwrap().is_empty());

        // previous fire 10 seconds ago
        let report = scheduler.tick_at(at(12, 5, 10)).await.unwrap();
        assert_eq!(report.fired, 1);

        let events = store.events_for_source(&source.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SCHEDULE_FIRED);
        assert_eq!(events[0].data["scheduled_for"], at(12, 5, 0).to_rfc3339());
        assert_eq!(events[0].status, EventStatus::Processing);

        let deliveries = store.deliveries_for_event(&events[0].id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_repeated_ticks_fire_once() {
        let (scheduler, store, source) = setup("*/5 * * * *", 1).await;

        assert_eq!(scheduler.tick_at(at(12, 5, 10)).await.unwrap().fired, 1);
        assert_eq!(scheduler.tick_at(at(12, 5, 40)).await.unwrap().fired, 0);
        assert_eq!(scheduler.tick_at(at(12, 7, 0)).await.unwrap().fired, 0);
        assert_eq!(store.events_for_source(&source.id).await.unwrap().len(), 1);

        assert_eq!(scheduler.tick_at(at(12, 10, 5)).await.unwrap().fired, 1);
        assert_eq!(store.events_for_source(&source.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_subscriptions_completes_immediately() {
        let (scheduler, store, source) = setup("0 * * * *", 0).await;

        assert_eq!(scheduler.tick_at(at(13, 0, 30)).await.unwrap().fired, 1);
        let events = store.events_for_source(&source.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Completed);
        assert!(store.deliveries_for_event(&events[0].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_source_is_isolated() {
        let (scheduler, store, good) = setup("*/5 * * * *", 1).await;
        let bad = EventSource::schedule("broken", "every tuesday", "UTC");
        store.create_source(&bad).await.unwrap();
        let bad_zone = EventSource::schedule("lost", "*/5 * * * *", "Mars/Olympus");
        store.create_source(&bad_zone).await.unwrap();

        let report = scheduler.tick_at(at(12, 5, 10)).await.unwrap();
        assert_eq!(report.evaluated, 3);
        assert_eq!(report.fired, 1);
        assert_eq!(report.invalid, 2);
        assert_eq!(report.errors, 0);

        assert_eq!(store.events_for_source(&good.id).await.unwrap().len(), 1);
        let bad = store.get_source(&bad.id).await.unwrap().unwrap();
        assert!(bad.last_error.unwrap().contains("every tuesday"));
        assert!(store.events_for_source(&bad.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_source_clears_error() {
        let (scheduler, store, _) = setup("*/5 * * * *", 0).await;
        let mut source = EventSource::schedule("fixable", "nope", "UTC");
        store.create_source(&source).await.unwrap();
        scheduler.tick_at(at(12, 5, 10)).await.unwrap();
        source = store.get_source(&source.id).await.unwrap().unwrap();
        assert!(source.last_error.is_some());

        source.config = json!({"cron": "*/5 * * * *", "timezone": "UTC"});
        let outcome = scheduler.evaluate_source(&source, at(12, 10, 10)).await.unwrap();
        assert!(matches!(outcome, SourceOutcome::Fired { deliveries: 0, .. }));
        let source = store.get_source(&source.id).await.unwrap().unwrap();
        assert!(source.last_error.is_none());
    }

    #[tokio::test]
    async fn test_frequent_schedule_still_fires() {
        let (scheduler, store, source) = setup("* * * * *", 1).await;
        assert_eq!(scheduler.tick_at(at(12, 1, 5)).await.unwrap().fired, 1);
        assert_eq!(scheduler.tick_at(at(12, 2, 5)).await.unwrap().fired, 1);
        assert_eq!(store.events_for_source(&source.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missed_fires_are_dropped() {
        let (scheduler, store, source) = setup("*/5 * * * *", 1).await;
        scheduler.tick_at(at(12, 0, 5)).await.unwrap();
        // scheduler down from 12:01 to 12:30
        assert_eq!(scheduler.tick_at(at(12, 30, 5)).await.unwrap().fired, 1);

        let events = store.events_for_source(&source.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| e.data["scheduled_for"] == at(12, 30, 0).to_rfc3339()));
        let source = store.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(source.last_scheduled_for, Some(at(12, 30, 0)));
    }

    #[tokio::test]
    async fn test_disabled_and_inactive_sources() {
        let (scheduler, store, source) = setup("*/5 * * * *", 1).await;
        let mut disabled = EventSource::schedule("off", "*/5 * * * *", "UTC");
        disabled.config["enabled"] = json!(false);
        store.create_source(&disabled).await.unwrap();
        store.set_source_active(&source.id, false).await.unwrap();

        let report = scheduler.tick_at(at(12, 5, 10)).await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.fired, 0);
    }
}
