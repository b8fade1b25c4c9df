//! The event store contract.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::watch;

use crate::error::{LedgerError, Result};

use super::event::{AggregateId, EventRecord, NewEvent};

/// Durable, ordered, append-only event log.
///
/// Implementations assign every committed event a strictly increasing,
/// gapless global position and enforce per-aggregate optimistic concurrency.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append the events of one aggregate.
    ///
    /// Fails with `ConcurrencyConflict` when the stored version of the
    /// aggregate differs from `expected_version`. An empty slice is a no-op.
    async fn append(&self, events: &[NewEvent], expected_version: u64) -> Result<Vec<EventRecord>>;

    /// Events of one aggregate with version greater than `from_version`, ascending.
    async fn get_events(&self, aggregate_id: &AggregateId, from_version: u64) -> Result<Vec<EventRecord>>;

    /// Events with position greater than `from_position`, ascending.
    async fn get_all_events(&self, from_position: u64, limit: Option<usize>) -> Result<Vec<EventRecord>>;

    /// Like [`EventStore::get_all_events`], restricted to one event type.
    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>>;

    /// Highest assigned global position, 0 for an empty log.
    async fn get_last_position(&self) -> Result<u64>;

    /// Current version of an aggregate, 0 when it has no events.
    async fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> Result<u64>;

    /// Receiver of the last position committed through this store instance.
    ///
    /// Only appends made in this process are signalled.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Check that a batch targets one aggregate with versions
/// `expected_version + 1, expected_version + 2, ...` and distinct ids.
pub(crate) fn validate_batch(events: &[NewEvent], expected_version: u64) -> Result<()> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    let mut ids = HashSet::with_capacity(events.len());
    for (offset, event) in events.iter().enumerate() {
        if event.aggregate_id != first.aggregate_id {
            return Err(LedgerError::invariant_violation(format!(
                "append batch mixes aggregates {} and {}",
                first.aggregate_id, event.aggregate_id
            )));
        }
        if event.aggregate_type != event.event.aggregate_type() {
            return Err(LedgerError::invariant_violation(format!(
                "{} is not a {} event",
                event.event_type(),
                event.aggregate_type
            )));
        }
        let expected = expected_version + offset as u64 + 1;
        if event.version != expected {
            return Err(LedgerError::invariant_violation(format!(
                "event for {} has version {}, expected {}",
                event.aggregate_id, event.version, expected
            )));
        }
        if !ids.insert(event.id) {
            return Err(LedgerError::invariant_violation(format!(
                "event id {} appears twice in one batch",
                event.id
            )));
        }
    }

    Ok(())
}
