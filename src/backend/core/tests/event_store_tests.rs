//! Integration tests for the in-memory event store and aggregate replay.
//!
//! Tests cover:
//! - Append/read round trips per aggregate
//! - Optimistic concurrency between racing writers
//! - Gapless global ordering and incremental reads
//! - Type-filtered reads and the append signal
//! - Replaying history into aggregates

use apex_ledger::error::ErrorCode;
use apex_ledger::events::{
    AgentAnnotated, AgentCreated, AgentRenamed, AgentState, AggregateId, AggregateRoot,
    DomainEvent, EventMetadata, EventStore, InMemoryEventStore, NewEvent, TaskCreated,
};
use std::sync::Arc;

fn created(id: &AggregateId, name: &str) -> NewEvent {
    NewEvent::new(
        id.clone(),
        1,
        DomainEvent::AgentCreated(AgentCreated {
            name: name.to_string(),
            model: "gpt-4".to_string(),
            capabilities: vec!["code".to_string()],
        }),
        EventMetadata::new(),
    )
}

fn renamed(id: &AggregateId, version: u64, name: &str) -> NewEvent {
    NewEvent::new(
        id.clone(),
        version,
        DomainEvent::AgentRenamed(AgentRenamed {
            name: name.to_string(),
        }),
        EventMetadata::new(),
    )
}

fn annotated(id: &AggregateId, version: u64) -> NewEvent {
    NewEvent::new(
        id.clone(),
        version,
        DomainEvent::AgentAnnotated(AgentAnnotated {
            note: format!("note {}", version),
        }),
        EventMetadata::new(),
    )
}

// ============================================================================
// Stream Tests
// ============================================================================

#[tokio::test]
async fn test_create_then_rename_replays_to_latest_name() {
    let store = InMemoryEventStore::new();
    let id = AggregateId::from("agent-1");

    store
        .append(&[created(&id, "A"), renamed(&id, 2, "B")], 0)
        .await
        .unwrap();

    let history = store.get_events(&id, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event_type(), "AgentCreated");
    assert_eq!(history[1].event_type(), "AgentRenamed");
    assert_eq!(
        history.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let root = AggregateRoot::<AgentState>::from_history(id, &history).unwrap();
    assert_eq!(root.state().name, "B");
    assert_eq!(root.version(), 2);
    assert!(root.changes().is_empty());
}

#[tokio::test]
async fn test_unknown_aggregate_has_empty_stream() {
    let store = InMemoryEventStore::new();
    let id = AggregateId::from("agent-missing");

    assert!(store.get_events(&id, 0).await.unwrap().is_empty());
    assert_eq!(store.get_aggregate_version(&id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected() {
    let store = InMemoryEventStore::new();
    let id = AggregateId::from("agent-1");
    store.append(&[created(&id, "A")], 0).await.unwrap();

    let err = store.append(&[created(&id, "A")], 0).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrencyConflict);

    // Nothing was written by the rejected append.
    assert_eq!(store.get_last_position().await.unwrap(), 1);
    assert_eq!(store.get_aggregate_version(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_gapped_batch_is_rejected() {
    let store = InMemoryEventStore::new();
    let id = AggregateId::from("agent-1");

    let err = store
        .append(&[created(&id, "A"), renamed(&id, 3, "B")], 0)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvariantViolation);
    assert!(store.is_empty());
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_racing_appends_exactly_one_wins() {
    let store = Arc::new(InMemoryEventStore::new());
    let id = AggregateId::from("agent-1");
    store.append(&[created(&id, "A")], 0).await.unwrap();

    let writers = (0..8).map(|i| {
        let store = Arc::clone(&store);
        let event = renamed(&id, 2, &format!("name-{}", i));
        tokio::spawn(async move { store.append(&[event], 1).await })
    });
    let results: Vec<_> = futures::future::join_all(writers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_conflict()));
    assert_eq!(store.get_aggregate_version(&id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_streams_get_gapless_positions() {
    let store = Arc::new(InMemoryEventStore::new());

    let writers = (0..16).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let id = AggregateId::new(format!("agent-{}", i));
            store.append(&[created(&id, "A")], 0).await?;
            store.append(&[annotated(&id, 2), annotated(&id, 3)], 1).await
        })
    });
    for joined in futures::future::join_all(writers).await {
        joined.unwrap().unwrap();
    }

    let all = store.get_all_events(0, None).await.unwrap();
    assert_eq!(all.len(), 48);
    for (index, record) in all.iter().enumerate() {
        assert_eq!(record.global_position, index as u64 + 1);
    }
    assert_eq!(store.get_last_position().await.unwrap(), 48);
}

// ============================================================================
// Global Read Tests
// ============================================================================

#[tokio::test]
async fn test_reading_from_last_position_returns_only_new_events() {
    let store = InMemoryEventStore::new();
    let first = AggregateId::from("agent-1");
    store.append(&[created(&first, "A")], 0).await.unwrap();

    let seen = store.get_all_events(0, None).await.unwrap();
    let last = seen.last().map(|r| r.global_position).unwrap();

    let second = AggregateId::from("agent-2");
    store.append(&[renamed(&first, 2, "B")], 1).await.unwrap();
    store.append(&[created(&second, "C")], 0).await.unwrap();
    store.append(&[annotated(&second, 2)], 1).await.unwrap();

    let fresh = store.get_all_events(last, None).await.unwrap();
    assert_eq!(fresh.len(), 3);
    assert_eq!(
        fresh.iter().map(|r| r.event_type()).collect::<Vec<_>>(),
        vec!["AgentRenamed", "AgentCreated", "AgentAnnotated"]
    );
    assert!(fresh.windows(2).all(|w| w[0].global_position < w[1].global_position));
    assert_eq!(fresh[0].global_position, last + 1);
}

#[tokio::test]
async fn test_batch_limit_and_type_filter() {
    let store = InMemoryEventStore::new();
    for i in 0..5 {
        let id = AggregateId::new(format!("agent-{}", i));
        store.append(&[created(&id, "A")], 0).await.unwrap();
        store.append(&[annotated(&id, 2)], 1).await.unwrap();
    }
    let task = AggregateId::from("task-1");
    store
        .append(
            &[NewEvent::new(
                task,
                1,
                DomainEvent::TaskCreated(TaskCreated {
                    title: "t".to_string(),
                    instruction: "do it".to_string(),
                    priority: 1,
                }),
                EventMetadata::new(),
            )],
            0,
        )
        .await
        .unwrap();

    let page = store.get_all_events(0, Some(4)).await.unwrap();
    assert_eq!(page.len(), 4);
    assert_eq!(page[3].global_position, 4);

    let annotations = store.get_events_by_type("AgentAnnotated", 0, None).await.unwrap();
    assert_eq!(annotations.len(), 5);
    assert!(annotations.iter().all(|r| r.event_type() == "AgentAnnotated"));

    let later = store
        .get_events_by_type("AgentAnnotated", annotations[2].global_position, Some(1))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].global_position, annotations[3].global_position);

    assert!(store.get_events_by_type("TaskCompleted", 0, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_append_signal_carries_head_position() {
    let store = InMemoryEventStore::new();
    let mut signal = store.subscribe();
    assert_eq!(*signal.borrow(), 0);

    let id = AggregateId::from("agent-1");
    store
        .append(&[created(&id, "A"), annotated(&id, 2)], 0)
        .await
        .unwrap();

    signal.changed().await.unwrap();
    assert_eq!(*signal.borrow_and_update(), 2);
}
