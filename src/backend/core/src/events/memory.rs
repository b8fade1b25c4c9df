//! In-process event store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::error::{ErrorCode, LedgerError, Result};
use crate::telemetry::LedgerMetrics;

use super::event::{AggregateId, EventId, EventRecord, NewEvent};
use super::store::{validate_batch, EventStore};

#[derive(Default)]
struct Log {
    /// Committed records; the record at index `i` has position `i + 1`.
    events: Vec<EventRecord>,
    /// Indices into `events` per aggregate, in version order.
    streams: HashMap<AggregateId, Vec<usize>>,
    ids: HashSet<EventId>,
}

/// Event store backed by process memory.
///
/// Positions are assigned under the write lock, so they are gapless and
/// readers never observe a partially applied batch.
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    head_tx: watch::Sender<u64>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            log: RwLock::new(Log::default()),
            head_tx,
        }
    }

    /// Number of committed events.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

fn page(records: impl Iterator<Item = EventRecord>, limit: Option<usize>) -> Vec<EventRecord> {
    match limit {
        Some(limit) => records.take(limit).collect(),
        None => records.collect(),
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, events: &[NewEvent], expected_version: u64) -> Result<Vec<EventRecord>> {
        let Some(first) = events.first() else {
            return Ok(Vec::new());
        };
        validate_batch(events, expected_version)?;

        let committed = {
            let mut log = self.log.write();

            let current = log
                .streams
                .get(&first.aggregate_id)
                .map(|s| s.len() as u64)
                .unwrap_or(0);
            if current != expected_version {
                LedgerMetrics::append_conflict(first.aggregate_type.as_str());
                return Err(LedgerError::concurrency_conflict(
                    first.aggregate_id.as_str(),
                    expected_version,
                    Some(current),
                ));
            }
            if let Some(dup) = events.iter().find(|e| log.ids.contains(&e.id)) {
                return Err(LedgerError::new(
                    ErrorCode::DuplicateRecord,
                    format!("Event {} was already appended", dup.id),
                ));
            }

            let mut committed = Vec::with_capacity(events.len());
            for event in events {
                let index = log.events.len();
                let record = event.clone().into_record(index as u64 + 1);
                log.ids.insert(record.id);
                log.streams
                    .entry(record.aggregate_id.clone())
                    .or_default()
                    .push(index);
                log.events.push(record.clone());
                committed.push(record);
            }
            committed
        };

        let head = committed.last().map(|r| r.global_position).unwrap_or_default();
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

    async fn get_events(&self, aggregate_id: &AggregateId, from_version: u64) -> Result<Vec<EventRecord>> {
        let log = self.log.read();
        let Some(stream) = log.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .iter()
            .skip(from_version as usize)
            .map(|&i| log.events[i].clone())
            .collect())
    }

    async fn get_all_events(&self, from_position: u64, limit: Option<usize>) -> Result<Vec<EventRecord>> {
        let log = self.log.read();
        let start = (from_position as usize).min(log.events.len());
        Ok(page(log.events[start..].iter().cloned(), limit))
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>> {
        let log = self.log.read();
        let start = (from_position as usize).min(log.events.len());
        let matching = log.events[start..]
            .iter()
            .filter(|r| r.event_type() == event_type)
            .cloned();
        Ok(page(matching, limit))
    }

    async fn get_last_position(&self) -> Result<u64> {
        Ok(self.log.read().events.len() as u64)
    }

    async fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> Result<u64> {
        Ok(self
            .log
            .read()
            .streams
            .get(aggregate_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }
}
