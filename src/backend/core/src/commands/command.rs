//! Commands, their envelope, and the outcome of handling one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{AgentStatus, AggregateId, AggregateType, EventMetadata, EventRecord};

// =============================================================================
// Command Enum
// =============================================================================

/// All commands the runtime accepts.
///
/// Each variant names the aggregate it targets; the serde tag doubles as the
/// routing key in the command bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    // Agent commands
    CreateAgent {
        agent_id: AggregateId,
        name: String,
        model: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    RenameAgent {
        agent_id: AggregateId,
        name: String,
    },
    ChangeAgentCapabilities {
        agent_id: AggregateId,
        capabilities: Vec<String>,
    },
    ChangeAgentStatus {
        agent_id: AggregateId,
        status: AgentStatus,
    },
    RetireAgent {
        agent_id: AggregateId,
        #[serde(default)]
        reason: Option<String>,
    },
    AnnotateAgent {
        agent_id: AggregateId,
        note: String,
    },

    // Task commands
    CreateTask {
        task_id: AggregateId,
        title: String,
        instruction: String,
        #[serde(default)]
        priority: i32,
    },
    AssignTask {
        task_id: AggregateId,
        agent_id: AggregateId,
    },
    CompleteTask {
        task_id: AggregateId,
        output: String,
    },
    CancelTask {
        task_id: AggregateId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Command {
    /// Get the command type name (the serde tag).
    pub const fn command_type(&self) -> &'static str {
        match self {
            Command::CreateAgent { .. } => "CreateAgent",
            Command::RenameAgent { .. } => "RenameAgent",
            Command::ChangeAgentCapabilities { .. } => "ChangeAgentCapabilities",
            Command::ChangeAgentStatus { .. } => "ChangeAgentStatus",
            Command::RetireAgent { .. } => "RetireAgent",
            Command::AnnotateAgent { .. } => "AnnotateAgent",
            Command::CreateTask { .. } => "CreateTask",
            Command::AssignTask { .. } => "AssignTask",
            Command::CompleteTask { .. } => "CompleteTask",
            Command::CancelTask { .. } => "CancelTask",
        }
    }

    /// The aggregate this command mutates.
    pub fn aggregate_id(&self) -> &AggregateId {
        match self {
            Command::CreateAgent { agent_id, .. }
            | Command::RenameAgent { agent_id, .. }
            | Command::ChangeAgentCapabilities { agent_id, .. }
            | Command::ChangeAgentStatus { agent_id, .. }
            | Command::RetireAgent { agent_id, .. }
            | Command::AnnotateAgent { agent_id, .. } => agent_id,
            Command::CreateTask { task_id, .. }
            | Command::AssignTask { task_id, .. }
            | Command::CompleteTask { task_id, .. }
            | Command::CancelTask { task_id, .. } => task_id,
        }
    }

    pub const fn aggregate_type(&self) -> AggregateType {
        match self {
            Command::CreateAgent { .. }
            | Command::RenameAgent { .. }
            | Command::ChangeAgentCapabilities { .. }
            | Command::ChangeAgentStatus { .. }
            | Command::RetireAgent { .. }
            | Command::AnnotateAgent { .. } => AggregateType::Agent,
            Command::CreateTask { .. }
            | Command::AssignTask { .. }
            | Command::CompleteTask { .. }
            | Command::CancelTask { .. } => AggregateType::Task,
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Caller-supplied context for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub causation_id: Option<Uuid>,

    /// When set, the command fails with a conflict unless the aggregate is at
    /// exactly this version, and it is never replayed.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self {
            user_id: None,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            expected_version: None,
        }
    }
}

/// A command with its identity and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub command: Command,

    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            metadata: CommandMetadata::default(),
        }
    }

    /// Decode an envelope from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation(mut self, id: Uuid) -> Self {
        self.metadata.causation_id = Some(id);
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.metadata.expected_version = Some(version);
        self
    }

    pub fn command_type(&self) -> &'static str {
        self.command.command_type()
    }

    /// Metadata stamped on every event this command produces.
    ///
    /// The correlation id falls back to the command id so a chain of commands
    /// started without one still groups together.
    pub fn event_metadata(&self) -> EventMetadata {
        let correlation = self
            .metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        let metadata = EventMetadata::new()
            .with_correlation(correlation)
            .with_causation(self.id);
        match &self.metadata.user_id {
            Some(user) => metadata.with_actor(user.clone()),
            None => metadata,
        }
    }
}

/// What a successfully handled command committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub aggregate_id: AggregateId,
    /// Aggregate version after the append
    pub version: u64,
    /// Committed records, empty when the command was a no-op
    pub records: Vec<EventRecord>,
}

impl CommandOutcome {
    pub fn last_position(&self) -> Option<u64> {
        self.records.last().map(|r| r.global_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_from_json_defaults() {
        let envelope = CommandEnvelope::from_json(
            r#"{"command": {"type": "RenameAgent", "agent_id": "agent-1", "name": "B"}}"#,
        )
        .unwrap();

        assert_eq!(envelope.command_type(), "RenameAgent");
        assert_eq!(envelope.command.aggregate_id().as_str(), "agent-1");
        assert_eq!(envelope.metadata.expected_version, None);
    }

    #[test]
    fn test_envelope_rejects_unknown_command() {
        let result = CommandEnvelope::from_json(r#"{"command": {"type": "LaunchRocket"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_metadata_from_envelope() {
        let envelope = CommandEnvelope::new(Command::AnnotateAgent {
            agent_id: "agent-1".into(),
            note: "hello".into(),
        })
        .with_user("operator");

        let metadata = envelope.event_metadata();
        assert_eq!(metadata.causation_id, Some(envelope.id));
        assert_eq!(metadata.correlation_id, Some(envelope.id.to_string()));
        assert_eq!(metadata.actor_id.as_deref(), Some("operator"));
    }

    #[test]
    fn test_command_routing_fields() {
        let command = Command::AssignTask {
            task_id: "task-1".into(),
            agent_id: "agent-1".into(),
        };
        assert_eq!(command.aggregate_id().as_str(), "task-1");
        assert_eq!(command.aggregate_type(), AggregateType::Task);
    }
}
