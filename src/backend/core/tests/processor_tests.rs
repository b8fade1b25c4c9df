//! Integration tests for the event processor and projections.
//!
//! Tests cover:
//! - Eventual consistency of read models after dispatch
//! - Skipping event types no projection handles
//! - Redelivery after a projector failure
//! - Checkpoints, start positions and rebuilds
//! - The background loop and cooperative shutdown

use apex_ledger::commands::{Command, CommandEnvelope};
use apex_ledger::config::{Config, ProcessorSettings, StartPosition};
use apex_ledger::error::{LedgerError, Result};
use apex_ledger::events::{AgentStatus, AggregateId, EventRecord, EventStore, TaskStatus};
use apex_ledger::projections::{
    AgentProjector, AgentQueries, CheckpointStore, EventProcessor, InMemoryCheckpointStore,
    ProcessorState, Projector, ReadModelRepository, TaskQueries,
};
use apex_ledger::Runtime;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    let mut config = Config::default();
    config.processor.poll_interval = Duration::from_millis(20);
    config.read_models.save_retry_delay = Duration::from_millis(1);
    config
}

async fn create_agent(runtime: &Runtime, id: &str, name: &str, capabilities: &[&str]) {
    runtime
        .dispatch(&CommandEnvelope::new(Command::CreateAgent {
            agent_id: AggregateId::from(id),
            name: name.to_string(),
            model: "claude".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }))
        .await
        .unwrap();
}

async fn annotate_agent(runtime: &Runtime, id: &str, note: &str) {
    runtime
        .dispatch(&CommandEnvelope::new(Command::AnnotateAgent {
            agent_id: AggregateId::from(id),
            note: note.to_string(),
        }))
        .await
        .unwrap();
}

/// Records every delivery and fails while `failing` is set.
struct RecordingProjector {
    failing: AtomicBool,
    delivered: Mutex<Vec<u64>>,
}

impl RecordingProjector {
    fn new(failing: bool) -> Self {
        Self {
            failing: AtomicBool::new(failing),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn delivered(&self) -> Vec<u64> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Projector for RecordingProjector {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &["AgentCreated", "AgentRenamed"]
    }

    async fn project(&self, record: &EventRecord) -> Result<()> {
        self.delivered.lock().push(record.global_position);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::internal("projection target unavailable"));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.delivered.lock().clear();
        Ok(())
    }
}

// ============================================================================
// Consistency Tests
// ============================================================================

#[tokio::test]
async fn test_read_model_is_stale_until_processed() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    create_agent(&runtime, "agent-1", "A", &["code"]).await;
    assert!(runtime.agents().find_by_id("agent-1").await.unwrap().is_none());

    let report = processor.run_once().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.position, 1);

    let view = runtime.agents().find_by_id("agent-1").await.unwrap().unwrap();
    assert_eq!(view.name, "A");
    assert_eq!(view.status, AgentStatus::Active);
    assert_eq!(view.last_processed_position, 1);
}

#[tokio::test]
async fn test_views_follow_the_full_workflow() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    create_agent(&runtime, "agent-1", "A", &["code", "search"]).await;
    create_agent(&runtime, "agent-2", "B", &["search"]).await;
    let task = AggregateId::from("task-1");
    for command in [
        Command::CreateTask {
            task_id: task.clone(),
            title: "Index".to_string(),
            instruction: "Index the corpus".to_string(),
            priority: 2,
        },
        Command::AssignTask {
            task_id: task.clone(),
            agent_id: AggregateId::from("agent-1"),
        },
        Command::ChangeAgentStatus {
            agent_id: AggregateId::from("agent-2"),
            status: AgentStatus::Paused,
        },
    ] {
        runtime.dispatch(&CommandEnvelope::new(command)).await.unwrap();
    }

    processor.run_once().await.unwrap();

    let agent = runtime.agents().find_by_id("agent-1").await.unwrap().unwrap();
    assert_eq!(agent.task_count, 1);
    assert_eq!(agent.version, 1);

    let paused = runtime.agent_queries().find_by_status(AgentStatus::Paused).await.unwrap();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].id, "agent-2");

    let assignable = runtime.agent_queries().find_assignable("search").await.unwrap();
    assert_eq!(assignable.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["agent-1"]);

    let assigned = runtime.task_queries().find_by_agent("agent-1").await.unwrap();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].status, TaskStatus::Assigned);
    assert_eq!(assigned[0].version, 2);
}

// ============================================================================
// Cursor Tests
// ============================================================================

#[tokio::test]
async fn test_unhandled_event_types_advance_the_cursor() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    annotate_agent(&runtime, "agent-1", "first").await;
    annotate_agent(&runtime, "agent-1", "second").await;

    let report = processor.run_once().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert!(report.skipped >= 4);
    assert_eq!(processor.last_processed_position(), 3);
    assert_eq!(processor.cursor("agents"), Some(3));
    assert_eq!(processor.cursor("tasks"), Some(3));

    assert_eq!(runtime.checkpoints().load("tasks").await.unwrap(), Some(3));
    assert!(processor.run_once().await.unwrap().is_idle());
}

#[tokio::test]
async fn test_processor_without_projections_still_advances() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = EventProcessor::new(
        Arc::clone(runtime.store()),
        Arc::new(InMemoryCheckpointStore::new()),
        ProcessorSettings::default(),
    );

    annotate_agent_after_create(&runtime).await;
    let report = processor.run_once().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(processor.last_processed_position(), 2);
}

#[tokio::test]
async fn test_processor_without_projections_resumes_from_its_checkpoint() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let processor = || {
        EventProcessor::new(
            Arc::clone(runtime.store()),
            Arc::clone(&checkpoints),
            ProcessorSettings::default(),
        )
    };

    annotate_agent_after_create(&runtime).await;
    let mut first = processor();
    first.run_once().await.unwrap();
    assert_eq!(
        checkpoints.load(EventProcessor::OWN_CHECKPOINT).await.unwrap(),
        Some(2)
    );

    annotate_agent(&runtime, "agent-1", "again").await;
    let mut second = processor();
    second.initialize().await.unwrap();
    assert_eq!(second.last_processed_position(), 2);

    let report = second.run_once().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(second.last_processed_position(), 3);
}

async fn annotate_agent_after_create(runtime: &Runtime) {
    create_agent(runtime, "agent-1", "A", &[]).await;
    annotate_agent(runtime, "agent-1", "hello").await;
}

#[tokio::test]
async fn test_failing_projector_is_redelivered() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let projector = Arc::new(RecordingProjector::new(true));
    let mut processor = EventProcessor::new(
        Arc::clone(runtime.store()),
        Arc::clone(&checkpoints),
        ProcessorSettings::default(),
    );
    processor.register(projector.clone()).unwrap();

    annotate_agent_after_create(&runtime).await;

    let report = processor.run_once().await.unwrap();
    assert_eq!(report.failed, vec!["recording"]);
    assert_eq!(processor.cursor("recording"), Some(0));
    assert_eq!(checkpoints.load("recording").await.unwrap().unwrap_or(0), 0);

    // Still failing: the same event comes back.
    processor.run_once().await.unwrap();
    assert_eq!(projector.delivered(), vec![1, 1]);

    projector.failing.store(false, Ordering::SeqCst);
    let report = processor.run_once().await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(projector.delivered(), vec![1, 1, 1]);
    assert_eq!(processor.cursor("recording"), Some(2));
    assert_eq!(checkpoints.load("recording").await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_failure_in_one_projection_does_not_block_others() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();
    processor.register(Arc::new(RecordingProjector::new(true))).unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    let report = processor.run_once().await.unwrap();

    assert_eq!(report.failed, vec!["recording"]);
    assert_eq!(processor.cursor("agents"), Some(1));
    assert_eq!(processor.last_processed_position(), 0);
    assert!(runtime.agents().find_by_id("agent-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failing_projection_does_not_stall_others_across_batches() {
    let mut config = config();
    config.processor.batch_size = 2;
    let runtime = Runtime::in_memory(config).unwrap();
    let mut processor = runtime.processor().unwrap();
    let broken = Arc::new(RecordingProjector::new(true));
    processor.register(broken.clone()).unwrap();

    for i in 1..=5 {
        create_agent(&runtime, &format!("agent-{}", i), "A", &[]).await;
    }
    let last = runtime.store().get_last_position().await.unwrap();
    assert_eq!(last, 5);

    for _ in 0..10 {
        processor.run_once().await.unwrap();
    }

    assert_eq!(processor.cursor("agents"), Some(last));
    assert_eq!(processor.cursor("tasks"), Some(last));
    assert_eq!(runtime.checkpoints().load("agents").await.unwrap(), Some(last));
    assert_eq!(runtime.agents().find_all().await.unwrap().len(), 5);

    // The broken projection stays on its first event and only holds back itself.
    assert_eq!(processor.cursor("recording"), Some(0));
    assert_eq!(processor.last_processed_position(), 0);
    assert!(broken.delivered().iter().all(|&position| position == 1));
    assert_eq!(broken.delivered().len(), 10);
}

#[tokio::test]
async fn test_reassignment_moves_agent_task_count() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    create_agent(&runtime, "agent-2", "B", &[]).await;
    let task = AggregateId::from("task-1");
    for command in [
        Command::CreateTask {
            task_id: task.clone(),
            title: "Index".to_string(),
            instruction: "Index the corpus".to_string(),
            priority: 1,
        },
        Command::AssignTask {
            task_id: task.clone(),
            agent_id: AggregateId::from("agent-1"),
        },
        Command::AssignTask {
            task_id: task.clone(),
            agent_id: AggregateId::from("agent-2"),
        },
    ] {
        runtime.dispatch(&CommandEnvelope::new(command)).await.unwrap();
    }

    processor.run_once().await.unwrap();

    let first = runtime.agents().find_by_id("agent-1").await.unwrap().unwrap();
    let second = runtime.agents().find_by_id("agent-2").await.unwrap().unwrap();
    assert_eq!(first.task_count, 0);
    assert_eq!(second.task_count, 1);
    assert!(runtime.task_queries().find_by_agent("agent-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_projection_name_is_rejected() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    let err = processor
        .register(Arc::new(AgentProjector::new(Arc::clone(runtime.agents()))))
        .unwrap_err();
    assert_eq!(err.code(), apex_ledger::ErrorCode::DuplicateHandler);
}

#[tokio::test]
async fn test_checkpoint_resumes_a_new_processor() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let projector = Arc::new(RecordingProjector::new(false));

    let mut first = runtime.processor().unwrap();
    first.register(projector.clone()).unwrap();
    create_agent(&runtime, "agent-1", "A", &[]).await;
    first.run_once().await.unwrap();

    create_agent(&runtime, "agent-2", "B", &[]).await;
    let mut second = runtime.processor().unwrap();
    second.register(projector.clone()).unwrap();
    second.initialize().await.unwrap();
    assert_eq!(second.cursor("recording"), Some(1));

    second.run_once().await.unwrap();
    assert_eq!(projector.delivered(), vec![1, 2]);
}

#[tokio::test]
async fn test_latest_start_position_skips_history() {
    let mut config = config();
    config.processor.start_from = StartPosition::Latest;
    let runtime = Runtime::in_memory(config).unwrap();

    create_agent(&runtime, "agent-old", "Old", &[]).await;

    let mut processor = runtime.processor().unwrap();
    processor.initialize().await.unwrap();
    assert_eq!(processor.last_processed_position(), 1);
    assert!(processor.run_once().await.unwrap().is_idle());

    create_agent(&runtime, "agent-new", "New", &[]).await;
    processor.run_once().await.unwrap();

    assert!(runtime.agents().find_by_id("agent-old").await.unwrap().is_none());
    assert!(runtime.agents().find_by_id("agent-new").await.unwrap().is_some());
}

#[tokio::test]
async fn test_rebuild_replays_from_the_beginning() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let mut processor = runtime.processor().unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    create_agent(&runtime, "agent-2", "B", &[]).await;
    processor.run_once().await.unwrap();
    let before = runtime.agents().find_all().await.unwrap();

    processor.rebuild(AgentProjector::NAME).await.unwrap();
    assert!(runtime.agents().find_all().await.unwrap().is_empty());
    assert_eq!(processor.cursor(AgentProjector::NAME), Some(0));
    assert_eq!(runtime.checkpoints().load(AgentProjector::NAME).await.unwrap(), None);

    processor.run_once().await.unwrap();
    assert_eq!(runtime.agents().find_all().await.unwrap(), before);

    assert!(processor.rebuild("unknown").await.is_err());
}

// ============================================================================
// Background Loop Tests
// ============================================================================

async fn wait_for_position(handle: &apex_ledger::projections::ProcessorHandle, position: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.position() < position {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("processor did not catch up");
}

#[tokio::test]
async fn test_background_loop_processes_and_stops() {
    let runtime = Runtime::in_memory(config()).unwrap();
    let handle = runtime.start_processor().await.unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    wait_for_position(&handle, 1).await;
    assert!(runtime.agents().find_by_id("agent-1").await.unwrap().is_some());

    create_agent(&runtime, "agent-2", "B", &[]).await;
    wait_for_position(&handle, 2).await;

    let status = handle.status().clone();
    assert!(status.iterations() >= 1);
    handle.stop().await.unwrap();
    assert_eq!(status.state(), ProcessorState::Idle);

    // Nothing processes after stop.
    create_agent(&runtime, "agent-3", "C", &[]).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(runtime.agents().find_by_id("agent-3").await.unwrap().is_none());
    assert_eq!(status.position(), 2);
}

#[tokio::test]
async fn test_polling_without_append_signal() {
    let mut config = config();
    config.processor.use_append_signal = false;
    let runtime = Runtime::in_memory(config).unwrap();
    let handle = runtime.start_processor().await.unwrap();

    create_agent(&runtime, "agent-1", "A", &[]).await;
    wait_for_position(&handle, 1).await;

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_waiting_returns_promptly() {
    let mut config = config();
    config.processor.poll_interval = Duration::from_secs(60);
    let runtime = Runtime::in_memory(config).unwrap();
    let handle = runtime.start_processor().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), ProcessorState::Waiting);

    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .expect("stop did not interrupt the wait")
        .unwrap();
}
