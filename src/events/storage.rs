// src/events/storage.rs
//! Event pipeline persistence using SQLite
//!
//! Every multi-row change (event fan-out, terminal delivery write plus event
//! status) runs in a single transaction. Delivery claims are a
//! compare-and-set `UPDATE ... WHERE status = ?`, so two processors sharing
//! a database never own the same delivery.

use crate::events::model::{
    from_millis, to_millis, DeliveryStatus, Event, EventDelivery, EventSource, EventStatus,
    EventSubscription, FanOut, NewEvent, QueueStats, SourceType, Workflow,
};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    logical_path TEXT NOT NULL,
    entry_symbol TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS event_sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_type TEXT NOT NULL,
    config TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_scheduled_for INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS event_subscriptions (
    id TEXT PRIMARY KEY,
    event_source_id TEXT NOT NULL REFERENCES event_sources(id),
    workflow_id TEXT NOT NULL REFERENCES workflows(id),
    event_type TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_source_id TEXT NOT NULL REFERENCES event_sources(id),
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    status TEXT NOT NULL,
    received_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS event_deliveries (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id),
    event_subscription_id TEXT NOT NULL REFERENCES event_subscriptions(id),
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER,
    last_error TEXT,
    result TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    UNIQUE (event_id, event_subscription_id)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_source ON event_subscriptions(event_source_id);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(event_source_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_event ON event_deliveries(event_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_queue ON event_deliveries(status, next_retry_at, created_at);
"#;

const SOURCE_COLUMNS: &str =
    "id, name, source_type, config, is_active, last_scheduled_for, last_error, created_at";

const EVENT_COLUMNS: &str = "id, event_source_id, event_type, data, status, received_at";

const DELIVERY_COLUMNS: &str = "id, event_id, event_subscription_id, workflow_id, status, \
     attempt_count, next_retry_at, last_error, result, created_at, started_at, completed_at";

fn parse_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<EventSource> {
    Ok(EventSource {
        id: row.get(0)?,
        name: row.get(1)?,
        source_type: parse_column::<SourceType>(row, 2)?,
        config: row.get(3)?,
        is_active: row.get(4)?,
        last_scheduled_for: millis_column(row, 5)?,
        last_error: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        event_source_id: row.get(1)?,
        event_type: row.get(2)?,
        data: row.get(3)?,
        status: parse_column::<EventStatus>(row, 4)?,
        received_at: from_millis(row.get(5)?),
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<EventDelivery> {
    Ok(EventDelivery {
        id: row.get(0)?,
        event_id: row.get(1)?,
        event_subscription_id: row.get(2)?,
        workflow_id: row.get(3)?,
        status: parse_column::<DeliveryStatus>(row, 4)?,
        attempt_count: row.get(5)?,
        next_retry_at: millis_column(row, 6)?,
        last_error: row.get(7)?,
        result: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        started_at: millis_column(row, 10)?,
        completed_at: millis_column(row, 11)?,
    })
}

/// Event pipeline store
#[derive(Clone)]
pub struct EventStore {
    db: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Open (or create) the database file
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self::from_connection(conn).await?;
        info!("Event store opened at {:?}", path);
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(SCHEMA)
            .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))
    }

    // Workflows

    pub async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO workflows (id, name, logical_path, entry_symbol, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                logical_path = excluded.logical_path,
                entry_symbol = excluded.entry_symbol,
                is_active = excluded.is_active
            "#,
            params![
                workflow.id,
                workflow.name,
                workflow.logical_path,
                workflow.entry_symbol,
                workflow.is_active,
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let db = self.db.lock().await;
        let workflow = db
            .query_row(
                "SELECT id, name, logical_path, entry_symbol, is_active FROM workflows WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Workflow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        logical_path: row.get(2)?,
                        entry_symbol: row.get(3)?,
                        is_active: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(workflow)
    }

    // Sources and subscriptions

    pub async fn create_source(&self, source: &EventSource) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            &format!(
                "INSERT INTO event_sources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                SOURCE_COLUMNS
            ),
            params![
                source.id,
                source.name,
                source.source_type.as_str(),
                source.config,
                source.is_active,
                source.last_scheduled_for.map(to_millis),
                source.last_error,
                to_millis(source.created_at),
            ],
        )?;
        debug!("Created {} source {} ({})", source.source_type, source.id, source.name);
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<EventSource>> {
        let db = self.db.lock().await;
        let source = db
            .query_row(
                &format!("SELECT {} FROM event_sources WHERE id = ?1", SOURCE_COLUMNS),
                params![id],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub async fn set_source_active(&self, id: &str, active: bool) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE event_sources SET is_active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("event source {}", id)));
        }
        Ok(())
    }

    /// Active sources of `source_type`, oldest first
    pub async fn active_sources(&self, source_type: SourceType) -> Result<Vec<EventSource>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM event_sources WHERE source_type = ?1 AND is_active = 1 ORDER BY created_at, id",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map(params![source_type.as_str()], source_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Store (or clear) the evaluation diagnostic of a source
    pub async fn record_source_error(&self, id: &str, error: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE event_sources SET last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub async fn create_subscription(&self, subscription: &EventSubscription) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO event_subscriptions (id, event_source_id, workflow_id, event_type, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                subscription.id,
                subscription.event_source_id,
                subscription.workflow_id,
                subscription.event_type,
                subscription.is_active,
            ],
        )?;
        Ok(())
    }

    // Events

    /// Create an Event and one delivery per matching active subscription,
    /// atomically.
    ///
    /// With `scheduled_for`, the source's `last_scheduled_for` is advanced in
    /// the same transaction and `None` is returned if that occurrence was
    /// already recorded.
    pub async fn fan_out(
        &self,
        new_event: NewEvent,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Option<FanOut>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let last: Option<Option<i64>> = tx
            .query_row(
                "SELECT last_scheduled_for FROM event_sources WHERE id = ?1",
                params![new_event.event_source_id],
                |row| row.get(0),
            )
            .optional()?;
        let last = match last {
            Some(last) => last,
            None => {
                return Err(EngineError::NotFound(format!(
                    "event source {}",
                    new_event.event_source_id
                )))
            }
        };

        if let Some(occurrence) = scheduled_for {
            if last.is_some_and(|last| last >= to_millis(occurrence)) {
                debug!(
                    "Occurrence {} of source {} already fired",
                    occurrence, new_event.event_source_id
                );
                return Ok(None);
            }
            tx.execute(
                "UPDATE event_sources SET last_scheduled_for = ?2 WHERE id = ?1",
                params![new_event.event_source_id, to_millis(occurrence)],
            )?;
        }

        let subscriptions: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, workflow_id FROM event_subscriptions
                WHERE event_source_id = ?1 AND is_active = 1
                  AND (event_type IS NULL OR event_type = ?2)
                ORDER BY id
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![new_event.event_source_id, new_event.event_type],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let now = Utc::now();
        let status = if subscriptions.is_empty() {
            EventStatus::Completed
        } else {
            EventStatus::Processing
        };
        let event = Event {
            id: ulid::Ulid::new().to_string(),
            event_source_id: new_event.event_source_id,
            event_type: new_event.event_type,
            data: new_event.data,
            status,
            received_at: now,
        };
        tx.execute(
            &format!("INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", EVENT_COLUMNS),
            params![
                event.id,
                event.event_source_id,
                event.event_type,
                event.data,
                event.status.as_str(),
                to_millis(event.received_at),
            ],
        )?;

        let mut deliveries = Vec::with_capacity(subscriptions.len());
        for (subscription_id, workflow_id) in subscriptions {
            let delivery = EventDelivery {
                id: ulid::Ulid::new().to_string(),
                event_id: event.id.clone(),
                event_subscription_id: subscription_id,
                workflow_id,
                status: DeliveryStatus::Pending,
                attempt_count: 0,
                next_retry_at: None,
                last_error: None,
                result: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            tx.execute(
                r#"
                INSERT INTO event_deliveries
                    (id, event_id, event_subscription_id, workflow_id, status, attempt_count, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                "#,
                params![
                    delivery.id,
                    delivery.event_id,
                    delivery.event_subscription_id,
                    delivery.workflow_id,
                    delivery.status.as_str(),
                    to_millis(now),
                ],
            )?;
            deliveries.push(delivery);
        }

        tx.commit()?;
        debug!(
            "Event {} ({}) fanned out to {} deliveries",
            event.id,
            event.event_type,
            deliveries.len()
        );
        metrics::counter!("events_created_total").increment(1);
        metrics::counter!("deliveries_created_total").increment(deliveries.len() as u64);

        Ok(Some(FanOut { event, deliveries }))
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let db = self.db.lock().await;
        let event = db
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Events of a source, newest first
    pub async fn events_for_source(&self, source_id: &str) -> Result<Vec<Event>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM events WHERE event_source_id = ?1 ORDER BY received_at DESC, id DESC",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![source_id], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // Deliveries

    pub async fn get_delivery(&self, id: &str) -> Result<Option<EventDelivery>> {
        let db = self.db.lock().await;
        let delivery = db
            .query_row(
                &format!("SELECT {} FROM event_deliveries WHERE id = ?1", DELIVERY_COLUMNS),
                params![id],
                delivery_from_row,
            )
            .optional()?;
        Ok(delivery)
    }

    pub async fn deliveries_for_event(&self, event_id: &str) -> Result<Vec<EventDelivery>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM event_deliveries WHERE event_id = ?1 ORDER BY created_at, id",
            DELIVERY_COLUMNS
        ))?;
        let deliveries = stmt
            .query_map(params![event_id], delivery_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deliveries)
    }

    /// Deliveries ready to run at `now`: PENDING, or FAILED with a due retry.
    /// Oldest due time first.
    pub async fn claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventDelivery>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            r#"
            SELECT {} FROM event_deliveries
            WHERE status = 'PENDING'
               OR (status = 'FAILED' AND next_retry_at <= ?1)
            ORDER BY COALESCE(next_retry_at, created_at), created_at, id
            LIMIT ?2
            "#,
            DELIVERY_COLUMNS
        ))?;
        let deliveries = stmt
            .query_map(params![to_millis(now), limit as i64], delivery_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deliveries)
    }

    /// Compare-and-set `observed` → RUNNING. `true` means the caller owns it.
    pub async fn try_claim(
        &self,
        id: &str,
        observed: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !matches!(observed, DeliveryStatus::Pending | DeliveryStatus::Failed) {
            return Ok(false);
        }
        let db = self.db.lock().await;
        let changed = db.execute(
            r#"
            UPDATE event_deliveries SET status = 'RUNNING', started_at = ?3
            WHERE id = ?1 AND status = ?2
              AND (status = 'PENDING' OR next_retry_at <= ?3)
            "#,
            params![id, observed.as_str(), to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    /// RUNNING → SUCCEEDED, and recompute the owning event's status
    pub async fn complete_delivery(
        &self,
        id: &str,
        result: &Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE event_deliveries
            SET status = 'SUCCEEDED', attempt_count = attempt_count + 1, result = ?2,
                last_error = NULL, next_retry_at = NULL, completed_at = ?3
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
            params![id, result, to_millis(now)],
        )?;
        if changed == 0 {
            return Err(EngineError::StorageFailed(format!("delivery {} is not RUNNING", id)));
        }
        Self::refresh_event_status(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// RUNNING → FAILED (retry at `next_retry_at`) or DEAD (when `None`),
    /// and recompute the owning event's status
    ///
    /// A FAILED row with `next_retry_at` set stays claimable: [`Self::claimable`]
    /// picks it up again once the retry time has passed. Only DEAD is terminal.
    pub async fn fail_delivery(
        &self,
        id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        let status = match next_retry_at {
            Some(_) => DeliveryStatus::Failed,
            None => DeliveryStatus::Dead,
        };
        let completed_at = match status {
            DeliveryStatus::Dead => Some(to_millis(now)),
            _ => None,
        };

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE event_deliveries
            SET status = ?2, attempt_count = attempt_count + 1, last_error = ?3,
                next_retry_at = ?4, completed_at = ?5
            WHERE id = ?1 AND status = 'RUNNING'
            "#,
            params![
                id,
                status.as_str(),
                error,
                next_retry_at.map(to_millis),
                completed_at,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::StorageFailed(format!("delivery {} is not RUNNING", id)));
        }
        Self::refresh_event_status(&tx, id)?;
        tx.commit()?;
        Ok(status)
    }

    /// RUNNING deliveries started before `cutoff`
    pub async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventDelivery>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM event_deliveries WHERE status = 'RUNNING' AND started_at < ?1 ORDER BY started_at",
            DELIVERY_COLUMNS
        ))?;
        let deliveries = stmt
            .query_map(params![to_millis(cutoff)], delivery_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deliveries)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM event_deliveries GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((parse_column::<DeliveryStatus>(row, 0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status, count as u64);
        }
        Ok(stats)
    }

    /// All SUCCEEDED → COMPLETED; all terminal with a DEAD → FAILED; else PROCESSING
    fn refresh_event_status(tx: &Transaction<'_>, delivery_id: &str) -> rusqlite::Result<()> {
        let event_id: String = tx.query_row(
            "SELECT event_id FROM event_deliveries WHERE id = ?1",
            params![delivery_id],
            |row| row.get(0),
        )?;

        let (total, succeeded, dead): (i64, i64, i64) = tx.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(status = 'SUCCEEDED'), 0),
                   COALESCE(SUM(status = 'DEAD'), 0)
            FROM event_deliveries WHERE event_id = ?1
            "#,
            params![event_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let status = if succeeded == total {
            EventStatus::Completed
        } else if succeeded + dead == total {
            EventStatus::Failed
        } else {
            EventStatus::Processing
        };
        tx.execute(
            "UPDATE events SET status = ?2 WHERE id = ?1",
            params![event_id, status.as_str()],
        )?;
        Ok(())
    }
}
