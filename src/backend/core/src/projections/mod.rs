//! Query side: read models, projectors and the processor that feeds them.
//!
//! - **`repository`**: `ReadModel`, `ReadModelRepository` and its in-memory,
//!   PostgreSQL and retrying implementations.
//! - **`views`**: `AgentView` / `TaskView` and their specialized queries.
//! - **`projector`**: `Projector` trait and the agent/task projectors.
//! - **`checkpoint`**: Per-projection cursor persistence.
//! - **`processor`**: The polling loop.

pub mod checkpoint;
pub mod processor;
pub mod projector;
pub mod repository;
pub mod retry;
pub mod views;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, PgCheckpointStore};
pub use processor::{
    EventProcessor, IterationReport, ProcessorHandle, ProcessorState, ProcessorStatus,
};
pub use projector::{AgentProjector, Projector, TaskProjector};
pub use repository::{
    InMemoryReadModelRepository, PgReadModelRepository, ReadModel, ReadModelRepository,
    RetryingRepository,
};
pub use retry::RetryPolicy;
pub use views::{AgentQueries, AgentView, TaskQueries, TaskView};
