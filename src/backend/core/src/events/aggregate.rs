//! Aggregates and the generic root that rebuilds them from history.
//!
//! An aggregate's state is a pure fold of its events (`AggregateState::reduce`).
//! `AggregateRoot<S>` owns the bookkeeping shared by every aggregate: the
//! version, replay checks and the changes recorded by the current command.

use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::error::{LedgerError, Result};

use super::event::{
    AgentAnnotated, AgentCapabilitiesChanged, AgentCreated, AgentRenamed, AgentRetired,
    AgentStatus, AgentStatusChanged, AggregateId, AggregateType, DomainEvent, EventMetadata,
    EventRecord, NewEvent, TaskAssigned, TaskCancelled, TaskCompleted, TaskCreated, TaskStatus,
};

// =============================================================================
// Aggregate State Trait
// =============================================================================

/// State of one aggregate kind.
///
/// `reduce` must be a pure function of `(self, event) -> self'`: no I/O and no
/// failure, since every persisted event is valid by definition. `decide` holds
/// the business checks and turns a command into the events to record.
pub trait AggregateState: Default + Clone + Send + Sync + 'static {
    const AGGREGATE_TYPE: AggregateType;

    /// Command types handled by this aggregate.
    const COMMAND_TYPES: &'static [&'static str];

    fn reduce(self, event: &DomainEvent) -> Self;

    fn decide(&self, id: &AggregateId, command: &Command) -> Result<Vec<DomainEvent>>;

    /// Whether any creation event has been applied.
    fn exists(&self) -> bool;
}

// =============================================================================
// Aggregate Root
// =============================================================================

/// An aggregate instance: state plus version and pending changes.
///
/// One instance per in-flight command; never shared.
#[derive(Debug, Clone)]
pub struct AggregateRoot<S: AggregateState> {
    id: AggregateId,
    version: u64,
    state: S,
    pending: Vec<NewEvent>,
}

impl<S: AggregateState> AggregateRoot<S> {
    /// An aggregate with no history.
    pub fn new(id: impl Into<AggregateId>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            state: S::default(),
            pending: Vec::new(),
        }
    }

    /// Rebuild an aggregate from its stored events.
    pub fn from_history(id: impl Into<AggregateId>, history: &[EventRecord]) -> Result<Self> {
        let mut root = Self::new(id);
        root.load_from_history(history)?;
        Ok(root)
    }

    /// Apply stored events in ascending version order.
    ///
    /// The sequence must continue exactly at `version + 1` with no gaps, and
    /// every event must belong to this aggregate.
    pub fn load_from_history(&mut self, history: &[EventRecord]) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(LedgerError::invariant_violation(format!(
                "cannot replay history into {} with {} uncommitted changes",
                self.id,
                self.pending.len()
            )));
        }

        let mut ordered: Vec<&EventRecord> = history.iter().collect();
        ordered.sort_by_key(|r| r.version);

        for record in ordered {
            if record.aggregate_id != self.id {
                return Err(LedgerError::invariant_violation(format!(
                    "event {} belongs to {}, not {}",
                    record.id, record.aggregate_id, self.id
                )));
            }
            if record.aggregate_type != S::AGGREGATE_TYPE {
                return Err(LedgerError::invariant_violation(format!(
                    "event {} is a {} event, expected {}",
                    record.id,
                    record.aggregate_type,
                    S::AGGREGATE_TYPE
                )));
            }
            if record.version != self.version + 1 {
                return Err(LedgerError::invariant_violation(format!(
                    "history of {} is not contiguous: expected version {}, got {}",
                    self.id,
                    self.version + 1,
                    record.version
                )));
            }
            self.state = std::mem::take(&mut self.state).reduce(&record.event);
            self.version = record.version;
        }

        Ok(())
    }

    /// Apply a new event and queue it for the next append.
    pub fn record_change(&mut self, event: DomainEvent, metadata: EventMetadata) {
        self.version += 1;
        self.state = std::mem::take(&mut self.state).reduce(&event);
        self.pending
            .push(NewEvent::new(self.id.clone(), self.version, event, metadata));
    }

    /// Run a command against the current state and record what it decides.
    ///
    /// Returns the number of recorded events; zero means the command was a no-op.
    pub fn execute(&mut self, command: &Command, metadata: EventMetadata) -> Result<usize> {
        let events = self.state.decide(&self.id, command)?;
        let count = events.len();
        for event in events {
            self.record_change(event, metadata.clone());
        }
        Ok(count)
    }

    /// Events recorded but not yet appended.
    pub fn changes(&self) -> &[NewEvent] {
        &self.pending
    }

    /// Forget recorded changes once they are durably stored.
    pub fn clear_changes(&mut self) {
        self.pending.clear();
    }

    /// The version the store holds, i.e. the expected version for the next append.
    pub fn persisted_version(&self) -> u64 {
        self.version - self.pending.len() as u64
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn wrong_aggregate(kind: AggregateType, command: &Command) -> LedgerError {
    LedgerError::internal(format!(
        "{} command routed to a {} aggregate",
        command.command_type(),
        kind
    ))
}

/// Sorted, de-duplicated, trimmed capability names.
pub fn normalize_capabilities(capabilities: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = capabilities
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

// =============================================================================
// Agent Aggregate
// =============================================================================

/// Reconstructed state of an agent derived from its event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub created: bool,
    pub name: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub retired_reason: Option<String>,
    pub notes: u32,
}

impl AgentState {
    fn ensure_mutable(&self, id: &AggregateId) -> Result<()> {
        if !self.created {
            return Err(LedgerError::aggregate_not_found("agent", id.as_str()));
        }
        if self.status == AgentStatus::Retired {
            return Err(LedgerError::invalid_state_transition(
                AgentStatus::Retired,
                "modified",
            ));
        }
        Ok(())
    }
}

impl AggregateState for AgentState {
    const AGGREGATE_TYPE: AggregateType = AggregateType::Agent;

    const COMMAND_TYPES: &'static [&'static str] = &[
        "CreateAgent",
        "RenameAgent",
        "ChangeAgentCapabilities",
        "ChangeAgentStatus",
        "RetireAgent",
        "AnnotateAgent",
    ];

    fn reduce(mut self, event: &DomainEvent) -> Self {
        match event {
            DomainEvent::AgentCreated(e) => {
                self.created = true;
                self.name = e.name.clone();
                self.model = e.model.clone();
                self.capabilities = e.capabilities.clone();
                self.status = AgentStatus::Active;
            }
            DomainEvent::AgentRenamed(e) => {
                self.name = e.name.clone();
            }
            DomainEvent::AgentCapabilitiesChanged(e) => {
                self.capabilities = e.capabilities.clone();
            }
            DomainEvent::AgentStatusChanged(e) => {
                self.status = e.to;
            }
            DomainEvent::AgentRetired(e) => {
                self.status = AgentStatus::Retired;
                self.retired_reason = e.reason.clone();
            }
            DomainEvent::AgentAnnotated(_) => {
                self.notes += 1;
            }
            // Ignore events that do not pertain to agents.
            _ => {}
        }
        self
    }

    fn decide(&self, id: &AggregateId, command: &Command) -> Result<Vec<DomainEvent>> {
        match command {
            Command::CreateAgent {
                name,
                model,
                capabilities,
                ..
            } => {
                if self.created {
                    return Err(LedgerError::aggregate_already_exists("agent", id.as_str()));
                }
                require_non_empty("name", name)?;
                require_non_empty("model", model)?;
                Ok(vec![DomainEvent::AgentCreated(AgentCreated {
                    name: name.trim().to_string(),
                    model: model.clone(),
                    capabilities: normalize_capabilities(capabilities),
                })])
            }
            Command::RenameAgent { name, .. } => {
                self.ensure_mutable(id)?;
                require_non_empty("name", name)?;
                let name = name.trim();
                if name == self.name {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::AgentRenamed(AgentRenamed {
                    name: name.to_string(),
                })])
            }
            Command::ChangeAgentCapabilities { capabilities, .. } => {
                self.ensure_mutable(id)?;
                let capabilities = normalize_capabilities(capabilities);
                if capabilities == self.capabilities {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::AgentCapabilitiesChanged(
                    AgentCapabilitiesChanged { capabilities },
                )])
            }
            Command::ChangeAgentStatus { status, .. } => {
                self.ensure_mutable(id)?;
                if *status == AgentStatus::Retired {
                    // Retirement carries a reason and is final; it has its own command.
                    return Err(LedgerError::invalid_state_transition(self.status, status));
                }
                if *status == self.status {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::AgentStatusChanged(AgentStatusChanged {
                    from: self.status,
                    to: *status,
                })])
            }
            Command::RetireAgent { reason, .. } => {
                self.ensure_mutable(id)?;
                Ok(vec![DomainEvent::AgentRetired(AgentRetired {
                    reason: reason.clone(),
                })])
            }
            Command::AnnotateAgent { note, .. } => {
                if !self.created {
                    return Err(LedgerError::aggregate_not_found("agent", id.as_str()));
                }
                require_non_empty("note", note)?;
                Ok(vec![DomainEvent::AgentAnnotated(AgentAnnotated {
                    note: note.clone(),
                })])
            }
            other => Err(wrong_aggregate(Self::AGGREGATE_TYPE, other)),
        }
    }

    fn exists(&self) -> bool {
        self.created
    }
}

// =============================================================================
// Task Aggregate
// =============================================================================

/// Reconstructed state of a task derived from its event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub created: bool,
    pub title: String,
    pub instruction: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_agent: Option<AggregateId>,
    pub output: Option<String>,
    pub cancel_reason: Option<String>,
}

impl AggregateState for TaskState {
    const AGGREGATE_TYPE: AggregateType = AggregateType::Task;

    const COMMAND_TYPES: &'static [&'static str] =
        &["CreateTask", "AssignTask", "CompleteTask", "CancelTask"];

    fn reduce(mut self, event: &DomainEvent) -> Self {
        match event {
            DomainEvent::TaskCreated(e) => {
                self.created = true;
                self.title = e.title.clone();
                self.instruction = e.instruction.clone();
                self.priority = e.priority;
                self.status = TaskStatus::Pending;
            }
            DomainEvent::TaskAssigned(e) => {
                self.assigned_agent = Some(e.agent_id.clone());
                self.status = TaskStatus::Assigned;
            }
            DomainEvent::TaskCompleted(e) => {
                self.output = Some(e.output.clone());
                self.status = TaskStatus::Completed;
            }
            DomainEvent::TaskCancelled(e) => {
                self.cancel_reason = e.reason.clone();
                self.status = TaskStatus::Cancelled;
            }
            // Ignore events that do not pertain to tasks.
            _ => {}
        }
        self
    }

    fn decide(&self, id: &AggregateId, command: &Command) -> Result<Vec<DomainEvent>> {
        if !self.created
            && command.aggregate_type() == Self::AGGREGATE_TYPE
            && !matches!(command, Command::CreateTask { .. })
        {
            return Err(LedgerError::aggregate_not_found("task", id.as_str()));
        }

        match command {
            Command::CreateTask {
                title,
                instruction,
                priority,
                ..
            } => {
                if self.created {
                    return Err(LedgerError::aggregate_already_exists("task", id.as_str()));
                }
                require_non_empty("title", title)?;
                Ok(vec![DomainEvent::TaskCreated(TaskCreated {
                    title: title.trim().to_string(),
                    instruction: instruction.clone(),
                    priority: *priority,
                })])
            }
            Command::AssignTask { agent_id, .. } => {
                if self.status.is_terminal() {
                    return Err(LedgerError::invalid_state_transition(
                        self.status,
                        TaskStatus::Assigned,
                    ));
                }
                if self.assigned_agent.as_ref() == Some(agent_id) {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::TaskAssigned(TaskAssigned {
                    agent_id: agent_id.clone(),
                    previous_agent: self.assigned_agent.clone(),
                })])
            }
            Command::CompleteTask { output, .. } => {
                if self.status != TaskStatus::Assigned {
                    return Err(LedgerError::invalid_state_transition(
                        self.status,
                        TaskStatus::Completed,
                    ));
                }
                Ok(vec![DomainEvent::TaskCompleted(TaskCompleted {
                    output: output.clone(),
                })])
            }
            Command::CancelTask { reason, .. } => {
                if self.status.is_terminal() {
                    return Err(LedgerError::invalid_state_transition(
                        self.status,
                        TaskStatus::Cancelled,
                    ));
                }
                Ok(vec![DomainEvent::TaskCancelled(TaskCancelled {
                    reason: reason.clone(),
                })])
            }
            other => Err(wrong_aggregate(Self::AGGREGATE_TYPE, other)),
        }
    }

    fn exists(&self) -> bool {
        self.created
    }
}

// =============================================================================
// Tests
// =============================================================================
