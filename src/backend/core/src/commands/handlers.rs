//! Aggregate-backed command handlers.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::events::{
    AgentState, AggregateId, AggregateRoot, AggregateState, EventRecord, EventStore, TaskState,
};

use super::bus::CommandHandler;
use super::command::{CommandEnvelope, CommandOutcome};

/// Loads aggregates from the event store and appends their changes.
pub struct AggregateRepository<S: AggregateState> {
    store: Arc<dyn EventStore>,
    _state: PhantomData<fn() -> S>,
}

impl<S: AggregateState> Clone for AggregateRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _state: PhantomData,
        }
    }
}

impl<S: AggregateState> AggregateRepository<S> {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            _state: PhantomData,
        }
    }

    /// Rebuild an aggregate from its full history. Unknown ids load at version 0.
    pub async fn load(&self, id: &AggregateId) -> Result<AggregateRoot<S>> {
        let history = self.store.get_events(id, 0).await?;
        AggregateRoot::from_history(id.clone(), &history)
    }

    /// Append pending changes at the persisted version, then clear them.
    pub async fn save(&self, root: &mut AggregateRoot<S>) -> Result<Vec<EventRecord>> {
        if root.changes().is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .store
            .append(root.changes(), root.persisted_version())
            .await?;
        root.clear_changes();
        Ok(records)
    }
}

/// Handles every command of one aggregate kind.
///
/// A `ConcurrencyConflict` from the append causes a reload and replay of the
/// command, up to `max_conflict_retries` times, unless the caller pinned an
/// `expected_version`.
pub struct AggregateCommandHandler<S: AggregateState> {
    repository: AggregateRepository<S>,
    max_conflict_retries: u32,
}

pub type AgentCommandHandler = AggregateCommandHandler<AgentState>;
pub type TaskCommandHandler = AggregateCommandHandler<TaskState>;

impl<S: AggregateState> AggregateCommandHandler<S> {
    pub fn new(store: Arc<dyn EventStore>, max_conflict_retries: u32) -> Self {
        Self {
            repository: AggregateRepository::new(store),
            max_conflict_retries,
        }
    }

    /// Command types this handler must be registered for.
    pub fn command_types() -> &'static [&'static str] {
        S::COMMAND_TYPES
    }
}

#[async_trait]
impl<S: AggregateState> CommandHandler for AggregateCommandHandler<S> {
    async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let command = &envelope.command;
        if command.aggregate_type() != S::AGGREGATE_TYPE {
            return Err(LedgerError::internal(format!(
                "{} routed to the {} handler",
                command.command_type(),
                S::AGGREGATE_TYPE
            )));
        }

        let id = command.aggregate_id();
        let pinned = envelope.metadata.expected_version;
        let mut attempt = 0;

        loop {
            let mut root = self.repository.load(id).await?;
            if let Some(expected) = pinned {
                if root.version() != expected {
                    return Err(LedgerError::concurrency_conflict(
                        id.as_str(),
                        expected,
                        Some(root.version()),
                    ));
                }
            }

            root.execute(command, envelope.event_metadata())?;

            match self.repository.save(&mut root).await {
                Ok(records) => {
                    return Ok(CommandOutcome {
                        aggregate_id: id.clone(),
                        version: root.version(),
                        records,
                    });
                }
                Err(err) if err.is_conflict() && pinned.is_none() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!(
                        aggregate_id = %id,
                        attempt,
                        "Concurrent write detected, replaying command"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
