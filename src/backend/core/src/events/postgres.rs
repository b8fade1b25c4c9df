//! PostgreSQL event store.
//!
//! Global positions come from the single-row `event_log_head` counter. An
//! append increments it first, holding its row lock until commit, so appends
//! commit in position order and a rolled-back append never leaves a gap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::telemetry::LedgerMetrics;

use super::event::{AggregateId, DomainEvent, EventId, EventMetadata, EventRecord, NewEvent};
use super::store::{validate_batch, EventStore};

/// Event store persisted in the `events` table.
pub struct PgEventStore {
    pool: PgPool,
    head_tx: watch::Sender<u64>,
}

impl PgEventStore {
    /// Create a new store with the given database pool.
    pub fn new(pool: PgPool) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self { pool, head_tx }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SELECT_EVENTS: &str = r#"
    SELECT position, id, event_type, aggregate_id, aggregate_type, version,
           payload, metadata, occurred_at
    FROM events
"#;

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, events: &[NewEvent], expected_version: u64) -> Result<Vec<EventRecord>> {
        let Some(first) = events.first() else {
            return Ok(Vec::new());
        };
        validate_batch(events, expected_version)?;

        let mut tx = self.pool.begin().await?;

        let head: i64 = sqlx::query_scalar(
            "UPDATE event_log_head SET position = position + $1 WHERE id = 1 RETURNING position",
        )
        .bind(events.len() as i64)
        .fetch_one(&mut *tx)
        .await?;

        // Read after taking the head lock: every earlier append has committed.
        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(first.aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if current as u64 != expected_version {
            tx.rollback().await?;
            LedgerMetrics::append_conflict(first.aggregate_type.as_str());
            return Err(LedgerError::concurrency_conflict(
                first.aggregate_id.as_str(),
                expected_version,
                Some(current as u64),
            ));
        }

        let start = head as u64 - events.len() as u64 + 1;
        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let position = start + offset as u64;
            sqlx::query(
                r#"
                INSERT INTO events (position, id, event_type, aggregate_id, aggregate_type,
                                    version, payload, metadata, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(position as i64)
            .bind(event.id.0)
            .bind(event.event_type())
            .bind(event.aggregate_id.as_str())
            .bind(event.aggregate_type.as_str())
            .bind(event.version as i64)
            .bind(serde_json::to_value(&event.event)?)
            .bind(serde_json::to_value(&event.metadata)?)
            .bind(event.metadata.timestamp)
            .execute(&mut *tx)
            .await?;

            committed.push(event.clone().into_record(position));
        }

        tx.commit().await?;

        let head = head as u64;
        LedgerMetrics::events_appended(first.aggregate_type.as_str(), committed.len(), head);
        self.head_tx.send_replace(head);

        debug!(
            aggregate_id = %first.aggregate_id,
            position = head,
            count = committed.len(),
            "Events appended"
        );

        Ok(committed)
    }

    #[instrument(skip(self))]
    async fn get_events(&self, aggregate_id: &AggregateId, from_version: u64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{} WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC",
            SELECT_EVENTS
        ))
        .bind(aggregate_id.as_str())
        .bind(from_version as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get_all_events(&self, from_position: u64, limit: Option<usize>) -> Result<Vec<EventRecord>> {
        // LIMIT NULL means no limit.
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{} WHERE position > $1 ORDER BY position ASC LIMIT $2",
            SELECT_EVENTS
        ))
        .bind(from_position as i64)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{} WHERE event_type = $1 AND position > $2 ORDER BY position ASC LIMIT $3",
            SELECT_EVENTS
        ))
        .bind(event_type)
        .bind(from_position as i64)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn get_last_position(&self) -> Result<u64> {
        // The head may run ahead of `events` only inside an open append transaction,
        // which this read cannot see.
        let position: i64 = sqlx::query_scalar("SELECT position FROM event_log_head WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(position as u64)
    }

    async fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> Result<u64> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(version as u64)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Row type for reading events from the database.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    position: i64,
    id: Uuid,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    payload: serde_json::Value,
    metadata: serde_json::Value,
    #[allow(dead_code)]
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event: DomainEvent = serde_json::from_value(row.payload)?;
        if event.event_type() != row.event_type {
            return Err(LedgerError::invariant_violation(format!(
                "event {} is stored as {} but decodes as {}",
                row.id,
                row.event_type,
                event.event_type()
            )));
        }
        let metadata: EventMetadata = serde_json::from_value(row.metadata)?;

        Ok(EventRecord {
            id: EventId(row.id),
            aggregate_id: AggregateId(row.aggregate_id),
            aggregate_type: row.aggregate_type.parse()?,
            version: row.version as u64,
            event,
            metadata,
            global_position: row.position as u64,
        })
    }
}
