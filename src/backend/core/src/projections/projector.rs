//! Projectors: turn log entries into read model rows.
//!
//! Projectors must be replay-safe. Both implementations here compare the
//! row's `last_processed_position` with the event's position and skip events
//! already reflected in the row.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::events::{DomainEvent, EventRecord};

use super::repository::ReadModelRepository;
use super::views::{AgentView, TaskView};

/// Applies events of the types it declares to one projection.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Unique projection name, also the checkpoint key.
    fn name(&self) -> &'static str;

    /// Event types this projector consumes. Others are skipped by the processor.
    fn event_types(&self) -> &'static [&'static str];

    fn handles(&self, event_type: &str) -> bool {
        self.event_types().contains(&event_type)
    }

    /// Apply one event. Must be idempotent.
    async fn project(&self, record: &EventRecord) -> Result<()>;

    /// Drop everything this projection has written.
    async fn reset(&self) -> Result<()>;
}

// =============================================================================
// Agent Projector
// =============================================================================

/// Maintains `AgentView` rows.
pub struct AgentProjector {
    views: Arc<dyn ReadModelRepository<AgentView>>,
}

impl AgentProjector {
    pub const NAME: &'static str = "agents";

    pub fn new(views: Arc<dyn ReadModelRepository<AgentView>>) -> Self {
        Self { views }
    }

    async fn apply_to(&self, target: &str, record: &EventRecord) -> Result<()> {
        let existing = self.views.find_by_id(target).await?;
        if let Some(view) = &existing {
            if view.last_processed_position >= record.global_position {
                debug!(agent_id = target, position = record.global_position, "Already projected");
                return Ok(());
            }
        }

        let view = match (&record.event, existing) {
            (DomainEvent::AgentCreated(created), _) => AgentView::created(record, created),
            (_, Some(mut view)) => {
                view.apply(record);
                view
            }
            (_, None) => {
                // The creation event predates this projection's start position.
                debug!(agent_id = target, position = record.global_position, "No view to update");
                return Ok(());
            }
        };

        self.views.save(&view).await
    }
}

#[async_trait]
impl Projector for AgentProjector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[
            "AgentCreated",
            "AgentRenamed",
            "AgentCapabilitiesChanged",
            "AgentStatusChanged",
            "AgentRetired",
            "TaskAssigned",
        ]
    }

    async fn project(&self, record: &EventRecord) -> Result<()> {
        match &record.event {
            DomainEvent::TaskAssigned(e) => {
                self.apply_to(e.agent_id.as_str(), record).await?;
                if let Some(previous) = &e.previous_agent {
                    self.apply_to(previous.as_str(), record).await?;
                }
                Ok(())
            }
            _ => self.apply_to(record.aggregate_id.as_str(), record).await,
        }
    }

    async fn reset(&self) -> Result<()> {
        self.views.clear().await?;
        Ok(())
    }
}

// =============================================================================
// Task Projector
// =============================================================================

/// Maintains `TaskView` rows.
pub struct TaskProjector {
    views: Arc<dyn ReadModelRepository<TaskView>>,
}

impl TaskProjector {
    pub const NAME: &'static str = "tasks";

    pub fn new(views: Arc<dyn ReadModelRepository<TaskView>>) -> Self {
        Self { views }
    }
}

#[async_trait]
impl Projector for TaskProjector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn event_types(&self) -> &'static [&'static str] {
        &["TaskCreated", "TaskAssigned", "TaskCompleted", "TaskCancelled"]
    }

    async fn project(&self, record: &EventRecord) -> Result<()> {
        let id = record.aggregate_id.as_str();
        let existing = self.views.find_by_id(id).await?;
        if let Some(view) = &existing {
            if view.last_processed_position >= record.global_position {
                debug!(task_id = id, position = record.global_position, "Already projected");
                return Ok(());
            }
        }

        let view = match (&record.event, existing) {
            (DomainEvent::TaskCreated(created), _) => TaskView::created(record, created),
            (_, Some(mut view)) => {
                view.apply(record);
                view
            }
            (_, None) => {
                debug!(task_id = id, position = record.global_position, "No view to update");
                return Ok(());
            }
        };

        self.views.save(&view).await
    }

    async fn reset(&self) -> Result<()> {
        self.views.clear().await?;
        Ok(())
    }
}
