//! Command bus: routes each command to exactly one registered handler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::{ErrorSeverity, LedgerError, Result};
use crate::telemetry::LedgerMetrics;

use super::command::{CommandEnvelope, CommandOutcome};

/// Handles one or more command types.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle the command, returning only after its events are committed or rejected.
    async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome>;
}

/// Synchronous router from a command type to its handler.
#[derive(Default)]
pub struct CommandBus {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command type.
    ///
    /// Fails with `DuplicateHandler` if the type already has one.
    pub fn register(&mut self, command_type: &'static str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        if self.handlers.contains_key(command_type) {
            return Err(LedgerError::duplicate_handler(command_type));
        }
        self.handlers.insert(command_type, handler);
        Ok(())
    }

    /// Register one handler for several command types.
    pub fn register_all(
        &mut self,
        command_types: &[&'static str],
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        for &command_type in command_types {
            self.register(command_type, Arc::clone(&handler))?;
        }
        Ok(())
    }

    /// Route a command to its handler and wait for it to finish.
    ///
    /// Handler errors are logged and returned unchanged.
    #[instrument(
        skip(self, envelope),
        fields(command_type = envelope.command_type(), command_id = %envelope.id)
    )]
    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let command_type = envelope.command_type();
        let Some(handler) = self.handlers.get(command_type) else {
            let err = LedgerError::unregistered_handler(command_type);
            error!(command_type, "No handler registered");
            LedgerMetrics::command(command_type, "unregistered");
            return Err(err);
        };

        match handler.handle(envelope).await {
            Ok(outcome) => {
                LedgerMetrics::command(command_type, "ok");
                info!(
                    aggregate_id = %outcome.aggregate_id,
                    version = outcome.version,
                    events = outcome.records.len(),
                    "Command handled"
                );
                Ok(outcome)
            }
            Err(err) => {
                if err.severity() == ErrorSeverity::Low {
                    LedgerMetrics::command(command_type, "rejected");
                    warn!(
                        error_code = err.code().as_str(),
                        error = %err,
                        "Command rejected"
                    );
                } else {
                    LedgerMetrics::command(command_type, "failed");
                    error!(
                        error_code = err.code().as_str(),
                        error = %err,
                        "Command failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Registered command types, sorted.
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn is_registered(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::error::ErrorCode;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
            Ok(CommandOutcome {
                aggregate_id: envelope.command.aggregate_id().clone(),
                version: 0,
                records: vec![],
            })
        }
    }

    fn rename() -> CommandEnvelope {
        CommandEnvelope::new(Command::RenameAgent {
            agent_id: "agent-1".into(),
            name: "B".into(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_handler() {
        let mut bus = CommandBus::new();
        bus.register("RenameAgent", Arc::new(EchoHandler)).unwrap();

        let outcome = bus.dispatch(&rename()).await.unwrap();
        assert_eq!(outcome.aggregate_id.as_str(), "agent-1");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut bus = CommandBus::new();
        bus.register("RenameAgent", Arc::new(EchoHandler)).unwrap();
        let err = bus.register("RenameAgent", Arc::new(EchoHandler)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateHandler);
    }

    #[tokio::test]
    async fn test_unregistered_dispatch_fails() {
        let bus = CommandBus::new();
        let err = bus.dispatch(&rename()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnregisteredHandler);
    }

    #[test]
    fn test_registered_types_sorted() {
        let mut bus = CommandBus::new();
        bus.register_all(&["RenameAgent", "CreateAgent"], Arc::new(EchoHandler))
            .unwrap();
        assert_eq!(bus.registered_types(), vec!["CreateAgent", "RenameAgent"]);
    }
}
