//! Event Sourcing System
//!
//! - **`event`**: Domain events, metadata, and the pending/committed event records.
//! - **`aggregate`**: `AggregateState` implementations and the generic `AggregateRoot`.
//! - **`store`**: The `EventStore` trait.
//! - **`memory`** / **`postgres`**: In-process and PostgreSQL event stores.

pub mod aggregate;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use aggregate::*;
pub use event::*;
pub use memory::InMemoryEventStore;
pub use postgres::PgEventStore;
pub use store::EventStore;
