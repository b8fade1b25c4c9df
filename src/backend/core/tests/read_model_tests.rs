//! Integration tests for read model repositories and save retries.
//!
//! Tests cover:
//! - Upsert, lookup and delete semantics
//! - Bounded retry of transient save failures
//! - Logic errors surfacing without retry
//! - Projector idempotence through a retrying repository

use apex_ledger::error::{ErrorCode, LedgerError, Result};
use apex_ledger::events::{
    AgentCreated, AgentStatus, AggregateId, DomainEvent, EventMetadata, NewEvent, TaskAssigned,
};
use apex_ledger::projections::{
    AgentProjector, AgentView, InMemoryReadModelRepository, Projector, ReadModelRepository,
    RetryPolicy, RetryingRepository,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn agent(id: &str, name: &str, position: u64) -> AgentView {
    let created = AgentCreated {
        name: name.to_string(),
        model: "claude".to_string(),
        capabilities: vec!["code".to_string()],
    };
    let record = NewEvent::new(
        AggregateId::from(id),
        1,
        DomainEvent::AgentCreated(created.clone()),
        EventMetadata::new(),
    )
    .into_record(position);
    AgentView::created(&record, &created)
}

/// Fails the first `failures` saves with the given error, then delegates.
struct FlakyRepository {
    inner: InMemoryReadModelRepository<AgentView>,
    failures: u32,
    code: ErrorCode,
    attempts: AtomicU32,
}

impl FlakyRepository {
    fn new(failures: u32, code: ErrorCode) -> Self {
        Self {
            inner: InMemoryReadModelRepository::new(),
            failures,
            code,
            attempts: AtomicU32::new(0),
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadModelRepository<AgentView> for FlakyRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<AgentView>> {
        self.inner.find_by_id(id).await
    }

    async fn find_all(&self) -> Result<Vec<AgentView>> {
        self.inner.find_all().await
    }

    async fn save(&self, model: &AgentView) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(match self.code {
                ErrorCode::TransientStoreFailure => LedgerError::transient("connection reset"),
                _ => LedgerError::validation("row rejected"),
            });
        }
        self.inner.save(model).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn clear(&self) -> Result<u64> {
        self.inner.clear().await
    }
}

fn retrying(flaky: &Arc<FlakyRepository>) -> RetryingRepository<AgentView> {
    RetryingRepository::new(
        Arc::clone(flaky) as Arc<dyn ReadModelRepository<AgentView>>,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
    )
}

// ============================================================================
// Repository Tests
// ============================================================================

#[tokio::test]
async fn test_save_is_an_upsert() {
    let repo = InMemoryReadModelRepository::<AgentView>::new();
    repo.save(&agent("agent-1", "A", 1)).await.unwrap();
    repo.save(&agent("agent-1", "B", 2)).await.unwrap();

    assert_eq!(repo.len(), 1);
    assert_eq!(repo.find_by_id("agent-1").await.unwrap().unwrap().name, "B");
}

#[tokio::test]
async fn test_find_all_orders_by_id_and_delete_reports_presence() {
    let repo = InMemoryReadModelRepository::<AgentView>::new();
    for id in ["agent-c", "agent-a", "agent-b"] {
        repo.save(&agent(id, id, 1)).await.unwrap();
    }

    let ids: Vec<String> = repo.find_all().await.unwrap().into_iter().map(|a| a.id).collect();
    assert_eq!(ids, vec!["agent-a", "agent-b", "agent-c"]);

    assert!(repo.delete("agent-b").await.unwrap());
    assert!(!repo.delete("agent-b").await.unwrap());
    assert!(repo.find_by_id("agent-b").await.unwrap().is_none());
    assert_eq!(repo.clear().await.unwrap(), 2);
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let flaky = Arc::new(FlakyRepository::new(2, ErrorCode::TransientStoreFailure));
    let repo = retrying(&flaky);

    repo.save(&agent("agent-1", "A", 1)).await.unwrap();
    assert_eq!(flaky.attempts(), 3);
    assert!(repo.find_by_id("agent-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_retries_stop_after_three_attempts() {
    let flaky = Arc::new(FlakyRepository::new(10, ErrorCode::TransientStoreFailure));
    let repo = retrying(&flaky);

    let err = repo.save(&agent("agent-1", "A", 1)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(flaky.attempts(), 3);
}

#[tokio::test]
async fn test_logic_errors_are_not_retried() {
    let flaky = Arc::new(FlakyRepository::new(10, ErrorCode::ValidationError));
    let repo = retrying(&flaky);

    let err = repo.save(&agent("agent-1", "A", 1)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(flaky.attempts(), 1);
}

// ============================================================================
// Projection Idempotence Tests
// ============================================================================

#[tokio::test]
async fn test_redelivered_events_leave_the_same_row() {
    let flaky = Arc::new(FlakyRepository::new(1, ErrorCode::TransientStoreFailure));
    let projector = AgentProjector::new(Arc::new(retrying(&flaky)));

    let created = NewEvent::new(
        AggregateId::from("agent-1"),
        1,
        DomainEvent::AgentCreated(AgentCreated {
            name: "A".to_string(),
            model: "claude".to_string(),
            capabilities: vec![],
        }),
        EventMetadata::new(),
    )
    .into_record(1);
    let assigned = NewEvent::new(
        AggregateId::from("task-1"),
        2,
        DomainEvent::TaskAssigned(TaskAssigned {
            agent_id: AggregateId::from("agent-1"),
            previous_agent: None,
        }),
        EventMetadata::new(),
    )
    .into_record(3);

    for record in [&created, &assigned, &created, &assigned] {
        projector.project(record).await.unwrap();
    }

    let view = flaky.find_by_id("agent-1").await.unwrap().unwrap();
    assert_eq!(view.task_count, 1);
    assert_eq!(view.status, AgentStatus::Active);
    assert_eq!(view.last_processed_position, 3);
}
