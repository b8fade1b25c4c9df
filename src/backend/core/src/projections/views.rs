//! Agent and task read models and their specialized queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{AgentCreated, AgentStatus, DomainEvent, EventRecord, TaskCreated, TaskStatus};

use super::repository::{InMemoryReadModelRepository, PgReadModelRepository, ReadModel};

// =============================================================================
// Agent View
// =============================================================================

/// Query-side view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    pub id: String,
    pub name: String,
    pub model: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    /// Tasks whose latest assignment names this agent
    pub task_count: u32,
    pub retired_reason: Option<String>,
    pub version: u64,
    pub last_processed_position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentView {
    pub fn created(record: &EventRecord, event: &AgentCreated) -> Self {
        Self {
            id: record.aggregate_id.to_string(),
            name: event.name.clone(),
            model: event.model.clone(),
            status: AgentStatus::Active,
            capabilities: event.capabilities.clone(),
            task_count: 0,
            retired_reason: None,
            version: record.version,
            last_processed_position: record.global_position,
            created_at: record.occurred_at(),
            updated_at: record.occurred_at(),
        }
    }

    /// Fold an event into the view.
    ///
    /// `TaskAssigned` comes from a task stream, so it moves the position but
    /// not the agent version. It counts for the new assignee and against the
    /// previous one.
    pub fn apply(&mut self, record: &EventRecord) {
        match &record.event {
            DomainEvent::AgentRenamed(e) => self.name = e.name.clone(),
            DomainEvent::AgentCapabilitiesChanged(e) => self.capabilities = e.capabilities.clone(),
            DomainEvent::AgentStatusChanged(e) => self.status = e.to,
            DomainEvent::AgentRetired(e) => {
                self.status = AgentStatus::Retired;
                self.retired_reason = e.reason.clone();
            }
            DomainEvent::TaskAssigned(e) => {
                if e.agent_id.as_str() == self.id {
                    self.task_count += 1;
                } else if e.previous_agent.as_ref().map(|a| a.as_str()) == Some(self.id.as_str()) {
                    self.task_count = self.task_count.saturating_sub(1);
                }
            }
            _ => {}
        }
        if record.aggregate_id.as_str() == self.id {
            self.version = record.version;
        }
        self.last_processed_position = record.global_position;
        self.updated_at = record.occurred_at();
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

impl ReadModel for AgentView {
    const TABLE: &'static str = "agent_views";

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn last_processed_position(&self) -> u64 {
        self.last_processed_position
    }
}

// =============================================================================
// Task View
// =============================================================================

/// Query-side view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub title: String,
    pub instruction: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub output: Option<String>,
    pub version: u64,
    pub last_processed_position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskView {
    pub fn created(record: &EventRecord, event: &TaskCreated) -> Self {
        Self {
            id: record.aggregate_id.to_string(),
            title: event.title.clone(),
            instruction: event.instruction.clone(),
            priority: event.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            output: None,
            version: record.version,
            last_processed_position: record.global_position,
            created_at: record.occurred_at(),
            updated_at: record.occurred_at(),
        }
    }

    pub fn apply(&mut self, record: &EventRecord) {
        match &record.event {
            DomainEvent::TaskAssigned(e) => {
                self.assigned_agent = Some(e.agent_id.to_string());
                self.status = TaskStatus::Assigned;
            }
            DomainEvent::TaskCompleted(e) => {
                self.output = Some(e.output.clone());
                self.status = TaskStatus::Completed;
            }
            DomainEvent::TaskCancelled(_) => self.status = TaskStatus::Cancelled,
            _ => {}
        }
        self.version = record.version;
        self.last_processed_position = record.global_position;
        self.updated_at = record.occurred_at();
    }
}

impl ReadModel for TaskView {
    const TABLE: &'static str = "task_views";

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn last_processed_position(&self) -> u64 {
        self.last_processed_position
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Read-only agent lookups beyond id.
#[async_trait]
pub trait AgentQueries: Send + Sync {
    async fn find_by_status(&self, status: AgentStatus) -> Result<Vec<AgentView>>;

    /// Agents holding every one of `capabilities`.
    async fn find_with_capabilities(&self, capabilities: &[String]) -> Result<Vec<AgentView>>;

    /// Active agents holding `capability`.
    async fn find_assignable(&self, capability: &str) -> Result<Vec<AgentView>>;
}

/// Read-only task lookups beyond id.
#[async_trait]
pub trait TaskQueries: Send + Sync {
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskView>>;

    async fn find_by_agent(&self, agent_id: &str) -> Result<Vec<TaskView>>;
}

#[async_trait]
impl AgentQueries for InMemoryReadModelRepository<AgentView> {
    async fn find_by_status(&self, status: AgentStatus) -> Result<Vec<AgentView>> {
        Ok(self.filter(|a| a.status == status))
    }

    async fn find_with_capabilities(&self, capabilities: &[String]) -> Result<Vec<AgentView>> {
        Ok(self.filter(|a| a.has_capabilities(capabilities)))
    }

    async fn find_assignable(&self, capability: &str) -> Result<Vec<AgentView>> {
        Ok(self.filter(|a| {
            a.status == AgentStatus::Active && a.capabilities.iter().any(|c| c == capability)
        }))
    }
}

#[async_trait]
impl TaskQueries for InMemoryReadModelRepository<TaskView> {
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskView>> {
        Ok(self.filter(|t| t.status == status))
    }

    async fn find_by_agent(&self, agent_id: &str) -> Result<Vec<TaskView>> {
        Ok(self.filter(|t| t.assigned_agent.as_deref() == Some(agent_id)))
    }
}

#[async_trait]
impl AgentQueries for PgReadModelRepository<AgentView> {
    async fn find_by_status(&self, status: AgentStatus) -> Result<Vec<AgentView>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM agent_views WHERE data->>'status' = $1 ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;

        Self::decode_rows(rows)
    }

    async fn find_with_capabilities(&self, capabilities: &[String]) -> Result<Vec<AgentView>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM agent_views WHERE data->'capabilities' @> $1 ORDER BY id",
        )
        .bind(serde_json::to_value(capabilities)?)
        .fetch_all(self.pool())
        .await?;

        Self::decode_rows(rows)
    }

    async fn find_assignable(&self, capability: &str) -> Result<Vec<AgentView>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT data FROM agent_views
            WHERE data->>'status' = 'active'
              AND data->'capabilities' @> $1
            ORDER BY id
            "#,
        )
        .bind(serde_json::json!([capability]))
        .fetch_all(self.pool())
        .await?;

        Self::decode_rows(rows)
    }
}

#[async_trait]
impl TaskQueries for PgReadModelRepository<TaskView> {
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskView>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM task_views WHERE data->>'status' = $1 ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;

        Self::decode_rows(rows)
    }

    async fn find_by_agent(&self, agent_id: &str) -> Result<Vec<TaskView>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM task_views WHERE data->>'assigned_agent' = $1 ORDER BY id",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;

        Self::decode_rows(rows)
    }
}
