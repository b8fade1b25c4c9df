//! Command side: commands, the bus that routes them, and aggregate handlers.

pub mod bus;
pub mod command;
pub mod handlers;

pub use bus::{CommandBus, CommandHandler};
pub use command::{Command, CommandEnvelope, CommandMetadata, CommandOutcome};
pub use handlers::{
    AgentCommandHandler, AggregateCommandHandler, AggregateRepository, TaskCommandHandler,
};
