//! Runtime wiring.
//!
//! Builds every component once and hands out shared `Arc` handles; nothing in
//! the crate is a global.

use std::sync::Arc;
use tracing::info;

use crate::commands::{
    AgentCommandHandler, CommandBus, CommandEnvelope, CommandOutcome, TaskCommandHandler,
};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::events::{AgentState, AggregateState, EventStore, InMemoryEventStore, PgEventStore, TaskState};
use crate::projections::{
    AgentProjector, AgentQueries, AgentView, CheckpointStore, EventProcessor,
    InMemoryCheckpointStore, InMemoryReadModelRepository, PgCheckpointStore,
    PgReadModelRepository, ProcessorHandle, ReadModelRepository, RetryPolicy, RetryingRepository,
    TaskProjector, TaskQueries, TaskView,
};

/// The assembled ledger: event store, command bus, read models and checkpoints.
#[derive(Clone)]
pub struct Runtime {
    config: Config,
    store: Arc<dyn EventStore>,
    bus: Arc<CommandBus>,
    agents: Arc<dyn ReadModelRepository<AgentView>>,
    tasks: Arc<dyn ReadModelRepository<TaskView>>,
    agent_queries: Arc<dyn AgentQueries>,
    task_queries: Arc<dyn TaskQueries>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl Runtime {
    /// Everything in process memory.
    pub fn in_memory(config: Config) -> Result<Self> {
        let agents = Arc::new(InMemoryReadModelRepository::<AgentView>::new());
        let tasks = Arc::new(InMemoryReadModelRepository::<TaskView>::new());

        Self::assemble(
            config,
            Arc::new(InMemoryEventStore::new()),
            agents.clone(),
            tasks.clone(),
            agents,
            tasks,
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    /// Everything in PostgreSQL. Migrations are not applied here.
    pub fn postgres(db: &Database, config: Config) -> Result<Self> {
        let pool = db.pool().clone();
        let agents = Arc::new(PgReadModelRepository::<AgentView>::new(pool.clone()));
        let tasks = Arc::new(PgReadModelRepository::<TaskView>::new(pool.clone()));

        Self::assemble(
            config,
            Arc::new(PgEventStore::new(pool.clone())),
            agents.clone(),
            tasks.clone(),
            agents,
            tasks,
            Arc::new(PgCheckpointStore::new(pool)),
        )
    }

    /// Wire caller-supplied stores.
    ///
    /// Read model saves are wrapped in the configured retry policy.
    pub fn assemble(
        config: Config,
        store: Arc<dyn EventStore>,
        agents: Arc<dyn ReadModelRepository<AgentView>>,
        tasks: Arc<dyn ReadModelRepository<TaskView>>,
        agent_queries: Arc<dyn AgentQueries>,
        task_queries: Arc<dyn TaskQueries>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;

        let retries = config.commands.max_conflict_retries;
        let mut bus = CommandBus::new();
        bus.register_all(
            AgentState::COMMAND_TYPES,
            Arc::new(AgentCommandHandler::new(Arc::clone(&store), retries)),
        )?;
        bus.register_all(
            TaskState::COMMAND_TYPES,
            Arc::new(TaskCommandHandler::new(Arc::clone(&store), retries)),
        )?;

        let policy = RetryPolicy::from(&config.read_models);
        let agents: Arc<dyn ReadModelRepository<AgentView>> =
            Arc::new(RetryingRepository::new(agents, policy));
        let tasks: Arc<dyn ReadModelRepository<TaskView>> =
            Arc::new(RetryingRepository::new(tasks, policy));

        info!(commands = ?bus.registered_types(), "Runtime assembled");

        Ok(Self {
            config,
            store,
            bus: Arc::new(bus),
            agents,
            tasks,
            agent_queries,
            task_queries,
            checkpoints,
        })
    }

    /// A processor with the agent and task projections registered.
    pub fn processor(&self) -> Result<EventProcessor> {
        let mut processor = EventProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.checkpoints),
            self.config.processor.clone(),
        );
        processor.register(Arc::new(AgentProjector::new(Arc::clone(&self.agents))))?;
        processor.register(Arc::new(TaskProjector::new(Arc::clone(&self.tasks))))?;
        Ok(processor)
    }

    /// Load checkpoints and spawn the processing loop.
    pub async fn start_processor(&self) -> Result<ProcessorHandle> {
        let mut processor = self.processor()?;
        processor.initialize().await?;
        Ok(processor.start())
    }

    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        self.bus.dispatch(envelope).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    pub fn agents(&self) -> &Arc<dyn ReadModelRepository<AgentView>> {
        &self.agents
    }

    pub fn tasks(&self) -> &Arc<dyn ReadModelRepository<TaskView>> {
        &self.tasks
    }

    pub fn agent_queries(&self) -> &Arc<dyn AgentQueries> {
        &self.agent_queries
    }

    pub fn task_queries(&self) -> &Arc<dyn TaskQueries> {
        &self.task_queries
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }
}
