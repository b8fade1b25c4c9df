//! Event definitions for the ledger.
//!
//! This module provides:
//! - Identifiers for events and aggregates
//! - `EventMetadata` carried by every stored event
//! - The closed `DomainEvent` sum type and its payloads
//! - `NewEvent` (pending, not yet positioned) and `EventRecord` (committed)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an aggregate (the stream its events belong to).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(pub String);

impl AggregateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier with a readable prefix, e.g. `agent-<uuid>`.
    pub fn generate(aggregate_type: AggregateType) -> Self {
        Self(format!("{}-{}", aggregate_type.as_str(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The closed set of aggregate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    Agent,
    Task,
}

impl AggregateType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "task" => Ok(Self::Task),
            other => Err(LedgerError::validation(format!("Unknown aggregate type: {}", other))),
        }
    }
}

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Paused,
    Retired,
}

impl AgentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Retired => "retired",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "retired" => Ok(Self::Retired),
            other => Err(LedgerError::validation(format!("Unknown agent status: {}", other))),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled tasks accept no further changes.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(LedgerError::validation(format!("Unknown task status: {}", other))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Metadata
// =============================================================================

/// Metadata associated with an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,

    /// Correlation ID shared by everything a request caused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The command that caused this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,

    /// User/agent that triggered this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            actor_id: None,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Set the actor ID.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor_id = Some(actor.into());
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Domain Events - Agent Events
// =============================================================================

/// Event: An agent was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCreated {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Event: An agent was renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRenamed {
    pub name: String,
}

/// Event: An agent's capability set was replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilitiesChanged {
    pub capabilities: Vec<String>,
}

/// Event: An agent moved between active and paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusChanged {
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Event: An agent was permanently retired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRetired {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Event: A free-form audit note was attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAnnotated {
    pub note: String,
}

// =============================================================================
// Domain Events - Task Events
// =============================================================================

/// Event: A task was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub title: String,
    pub instruction: String,
    #[serde(default)]
    pub priority: i32,
}

/// Event: A task was assigned to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub agent_id: AggregateId,
    /// Agent the task was taken from on reassignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_agent: Option<AggregateId>,
}

/// Event: A task completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub output: String,
}

/// Event: A task was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCancelled {
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Domain Event Enum
// =============================================================================

/// All domain events in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // Agent events
    AgentCreated(AgentCreated),
    AgentRenamed(AgentRenamed),
    AgentCapabilitiesChanged(AgentCapabilitiesChanged),
    AgentStatusChanged(AgentStatusChanged),
    AgentRetired(AgentRetired),
    AgentAnnotated(AgentAnnotated),

    // Task events
    TaskCreated(TaskCreated),
    TaskAssigned(TaskAssigned),
    TaskCompleted(TaskCompleted),
    TaskCancelled(TaskCancelled),
}

impl DomainEvent {
    /// Every event type name, in declaration order.
    pub const TYPES: &'static [&'static str] = &[
        "AgentCreated",
        "AgentRenamed",
        "AgentCapabilitiesChanged",
        "AgentStatusChanged",
        "AgentRetired",
        "AgentAnnotated",
        "TaskCreated",
        "TaskAssigned",
        "TaskCompleted",
        "TaskCancelled",
    ];

    /// Get the event type name (the serde tag).
    pub const fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::AgentCreated(_) => "AgentCreated",
            DomainEvent::AgentRenamed(_) => "AgentRenamed",
            DomainEvent::AgentCapabilitiesChanged(_) => "AgentCapabilitiesChanged",
            DomainEvent::AgentStatusChanged(_) => "AgentStatusChanged",
            DomainEvent::AgentRetired(_) => "AgentRetired",
            DomainEvent::AgentAnnotated(_) => "AgentAnnotated",
            DomainEvent::TaskCreated(_) => "TaskCreated",
            DomainEvent::TaskAssigned(_) => "TaskAssigned",
            DomainEvent::TaskCompleted(_) => "TaskCompleted",
            DomainEvent::TaskCancelled(_) => "TaskCancelled",
        }
    }

    /// The kind of aggregate that emits this event.
    pub const fn aggregate_type(&self) -> AggregateType {
        match self {
            DomainEvent::AgentCreated(_)
            | DomainEvent::AgentRenamed(_)
            | DomainEvent::AgentCapabilitiesChanged(_)
            | DomainEvent::AgentStatusChanged(_)
            | DomainEvent::AgentRetired(_)
            | DomainEvent::AgentAnnotated(_) => AggregateType::Agent,
            DomainEvent::TaskCreated(_)
            | DomainEvent::TaskAssigned(_)
            | DomainEvent::TaskCompleted(_)
            | DomainEvent::TaskCancelled(_) => AggregateType::Task,
        }
    }
}

// =============================================================================
// Pending and Committed Events
// =============================================================================

/// An event produced by a command but not yet appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    /// Version of this event within its aggregate (1-based)
    pub version: u64,
    pub event: DomainEvent,
    pub metadata: EventMetadata,
}

impl NewEvent {
    pub fn new(aggregate_id: AggregateId, version: u64, event: DomainEvent, metadata: EventMetadata) -> Self {
        Self {
            id: EventId::new(),
            aggregate_type: event.aggregate_type(),
            aggregate_id,
            version,
            event,
            metadata,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Attach the position assigned by the store.
    pub fn into_record(self, global_position: u64) -> EventRecord {
        EventRecord {
            id: self.id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            version: self.version,
            event: self.event,
            metadata: self.metadata,
            global_position,
        }
    }
}

/// An immutable, committed entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    pub version: u64,
    pub event: DomainEvent,
    pub metadata: EventMetadata,
    /// Total-order index across every aggregate, assigned at append time
    pub global_position: u64,
}

impl EventRecord {
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }
}
