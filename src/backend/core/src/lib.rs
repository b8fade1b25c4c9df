#![allow(clippy::result_large_err)]
//! # Apex Ledger
//!
//! Event-sourced command and projection runtime for agent swarms.
//!
//! ## Architecture
//!
//! - **Events**: Append-only, globally ordered event log with per-aggregate
//!   optimistic concurrency (PostgreSQL and in-memory stores)
//! - **Aggregates**: Agent and task state rebuilt from history by a pure reduce
//! - **Commands**: Bus routing each command to one aggregate handler
//! - **Projections**: Polling processor feeding idempotent projectors and
//!   read model repositories with bounded save retries
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod projections;
pub mod runtime;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, LedgerError, Result};
pub use runtime::Runtime;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::commands::{
        Command, CommandBus, CommandEnvelope, CommandHandler, CommandMetadata, CommandOutcome,
    };
    pub use crate::config::{Config, StartPosition};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, LedgerError, Result};
    pub use crate::events::{
        AgentStatus, AggregateId, AggregateRoot, AggregateState, AggregateType, DomainEvent,
        EventMetadata, EventRecord, EventStore, InMemoryEventStore, NewEvent, TaskStatus,
    };
    pub use crate::projections::{
        AgentQueries, AgentView, CheckpointStore, EventProcessor, ProcessorHandle, ProcessorState,
        Projector, ReadModel, ReadModelRepository, TaskQueries, TaskView,
    };
    pub use crate::runtime::Runtime;
}
