//! Event processor: the background loop that advances projections.
//!
//! Each registered projection keeps its own cursor and reads its own batch of
//! up to `batch_size` events after it. Projections sitting at the same cursor
//! share one fetch. Every event of the batch is offered in position order:
//!
//! - the projection handles the type: project it and advance on success
//! - it does not: advance anyway (skip-and-advance)
//! - the projector fails: the projection is blocked for the rest of the
//!   iteration and the event is redelivered on the next one
//!
//! A projection stuck on a failing event only holds back its own cursor.
//! Cursors are persisted through the [`CheckpointStore`] at the end of every
//! iteration, so delivery is at-least-once and projectors must be idempotent.
//! With no projection registered the processor keeps its own cursor under
//! [`EventProcessor::OWN_CHECKPOINT`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ProcessorSettings, StartPosition};
use crate::error::{LedgerError, Result};
use crate::events::{EventRecord, EventStore};
use crate::telemetry::LedgerMetrics;

use super::checkpoint::CheckpointStore;
use super::projector::Projector;

// =============================================================================
// State
// =============================================================================

/// Where the processor loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Not running
    Idle = 0,
    /// Fetching the next batch
    Polling = 1,
    /// Applying a batch
    Processing = 2,
    /// Nothing new; sleeping until the interval elapses or an append arrives
    Waiting = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Processing,
            3 => Self::Waiting,
            _ => Self::Idle,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
        }
    }
}

/// Live statistics shared between the processor and its handle.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStatus {
    state: Arc<AtomicU8>,
    /// Lowest projection cursor after the last iteration
    pub position: Arc<AtomicU64>,
    /// Completed iterations
    pub iterations: Arc<AtomicU64>,
    /// Successful projector calls
    pub applied: Arc<AtomicU64>,
    /// Failed projector calls
    pub failures: Arc<AtomicU64>,
}

impl ProcessorStatus {
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Summary of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Events read from the store, counted once per distinct fetch
    pub fetched: usize,
    /// Successful projector calls
    pub applied: usize,
    /// Deliveries passed over because the projection does not handle the type
    pub skipped: usize,
    /// Projections that failed and are behind
    pub failed: Vec<&'static str>,
    /// `last_processed_position` after the iteration
    pub position: u64,
}

impl IterationReport {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }

    /// Whether any cursor moved.
    pub fn made_progress(&self) -> bool {
        self.applied + self.skipped > 0
    }
}

struct Subscription {
    projector: Arc<dyn Projector>,
    cursor: u64,
    persisted: Option<u64>,
    initialized: bool,
}

// =============================================================================
// Processor
// =============================================================================

/// Drives registered projectors from the event log.
pub struct EventProcessor {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: ProcessorSettings,
    subscriptions: Vec<Subscription>,
    /// Progress when no projection is registered
    own_cursor: Option<u64>,
    own_persisted: Option<u64>,
    status: ProcessorStatus,
}

impl EventProcessor {
    /// Checkpoint name of the processor's own cursor.
    pub const OWN_CHECKPOINT: &'static str = "__processor";

    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            checkpoints,
            settings,
            subscriptions: Vec::new(),
            own_cursor: None,
            own_persisted: None,
            status: ProcessorStatus::default(),
        }
    }

    /// Add a projection. Names must be unique.
    pub fn register(&mut self, projector: Arc<dyn Projector>) -> Result<()> {
        let name = projector.name();
        if name == Self::OWN_CHECKPOINT {
            return Err(LedgerError::validation(format!(
                "Projection name is reserved: {}",
                name
            )));
        }
        if self.subscriptions.iter().any(|s| s.projector.name() == name) {
            return Err(LedgerError::duplicate_handler(name));
        }
        self.subscriptions.push(Subscription {
            projector,
            cursor: 0,
            persisted: None,
            initialized: false,
        });
        Ok(())
    }

    pub fn projection_names(&self) -> Vec<&'static str> {
        self.subscriptions.iter().map(|s| s.projector.name()).collect()
    }

    /// Load cursors for projections not yet initialized.
    ///
    /// A stored checkpoint wins; otherwise the configured start position applies.
    pub async fn initialize(&mut self) -> Result<()> {
        let mut latest = None;

        for sub in self.subscriptions.iter_mut().filter(|s| !s.initialized) {
            let name = sub.projector.name();
            sub.cursor = match self.checkpoints.load(name).await? {
                Some(position) => {
                    sub.persisted = Some(position);
                    position
                }
                None => match self.settings.start_from {
                    StartPosition::Beginning => 0,
                    StartPosition::Latest => match latest {
                        Some(position) => position,
                        None => {
                            let position = self.store.get_last_position().await?;
                            latest = Some(position);
                            position
                        }
                    },
                },
            };
            sub.initialized = true;
            info!(projection = name, position = sub.cursor, "Projection cursor loaded");
        }

        if self.own_cursor.is_none() {
            let stored = self.checkpoints.load(Self::OWN_CHECKPOINT).await?;
            self.own_persisted = stored;
            self.own_cursor = Some(match (stored, self.settings.start_from) {
                (Some(position), _) => position,
                (None, StartPosition::Beginning) => 0,
                (None, StartPosition::Latest) => match latest {
                    Some(position) => position,
                    None => self.store.get_last_position().await?,
                },
            });
        }

        self.status.position.store(self.last_processed_position(), Ordering::Release);
        Ok(())
    }

    /// Lowest projection cursor, or the processor's own cursor with no projections.
    pub fn last_processed_position(&self) -> u64 {
        self.subscriptions
            .iter()
            .map(|s| s.cursor)
            .min()
            .unwrap_or_else(|| self.own_cursor.unwrap_or(0))
    }

    /// Cursor of one projection.
    pub fn cursor(&self, name: &str) -> Option<u64> {
        self.subscriptions
            .iter()
            .find(|s| s.projector.name() == name)
            .map(|s| s.cursor)
    }

    pub fn status(&self) -> ProcessorStatus {
        self.status.clone()
    }

    /// Execute exactly one poll/process iteration.
    #[instrument(skip(self))]
    pub async fn run_once(&mut self) -> Result<IterationReport> {
        self.initialize().await?;
        self.status.set_state(ProcessorState::Polling);

        let started = Instant::now();
        let mut report = IterationReport::default();

        if self.subscriptions.is_empty() {
            self.advance_own_cursor(&mut report).await?;
        } else {
            let mut batches: HashMap<u64, Arc<Vec<EventRecord>>> = HashMap::new();

            for index in 0..self.subscriptions.len() {
                let from = self.subscriptions[index].cursor;
                let batch = match batches.get(&from) {
                    Some(batch) => Arc::clone(batch),
                    None => {
                        let batch = Arc::new(
                            self.store
                                .get_all_events(from, Some(self.settings.batch_size))
                                .await?,
                        );
                        report.fetched += batch.len();
                        batches.insert(from, Arc::clone(&batch));
                        batch
                    }
                };
                if batch.is_empty() {
                    continue;
                }

                self.status.set_state(ProcessorState::Processing);
                self.deliver(index, &batch, &mut report).await;
            }
        }

        report.position = self.last_processed_position();
        if report.is_idle() {
            return Ok(report);
        }

        self.persist_cursors().await?;

        self.status.position.store(report.position, Ordering::Release);
        self.status.iterations.fetch_add(1, Ordering::Relaxed);
        LedgerMetrics::batch_duration(started.elapsed().as_secs_f64());

        debug!(
            fetched = report.fetched,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed.len(),
            position = report.position,
            "Iteration complete"
        );

        Ok(report)
    }

    /// Offer a batch to one projection until it is exhausted or a projector fails.
    async fn deliver(&mut self, index: usize, batch: &[EventRecord], report: &mut IterationReport) {
        let sub = &mut self.subscriptions[index];
        let name = sub.projector.name();

        for record in batch {
            let position = record.global_position;
            if sub.cursor >= position {
                continue;
            }

            if !sub.projector.handles(record.event_type()) {
                sub.cursor = position;
                report.skipped += 1;
                continue;
            }

            match sub.projector.project(record).await {
                Ok(()) => {
                    sub.cursor = position;
                    report.applied += 1;
                    self.status.applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(cause) => {
                    let err = LedgerError::projector_failure(name, position, &cause);
                    err.log();
                    warn!(
                        projection = name,
                        position,
                        event_type = record.event_type(),
                        error = %cause,
                        "Projector failed, event will be redelivered"
                    );
                    LedgerMetrics::projection_failure(name);
                    self.status.failures.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(name);
                    return;
                }
            }
        }
    }

    async fn advance_own_cursor(&mut self, report: &mut IterationReport) -> Result<()> {
        let from = self.own_cursor.unwrap_or(0);
        let batch = self
            .store
            .get_all_events(from, Some(self.settings.batch_size))
            .await?;
        report.fetched = batch.len();
        report.skipped = batch.len();
        if let Some(last) = batch.last() {
            self.own_cursor = Some(last.global_position);
        }
        Ok(())
    }

    async fn persist_cursors(&mut self) -> Result<()> {
        if self.subscriptions.is_empty() {
            if let Some(cursor) = self.own_cursor {
                if self.own_persisted != Some(cursor) {
                    self.checkpoints.save(Self::OWN_CHECKPOINT, cursor).await?;
                    self.own_persisted = Some(cursor);
                }
            }
            return Ok(());
        }

        for sub in &mut self.subscriptions {
            if sub.persisted == Some(sub.cursor) {
                continue;
            }
            let name = sub.projector.name();
            self.checkpoints.save(name, sub.cursor).await?;
            sub.persisted = Some(sub.cursor);
            LedgerMetrics::projection_position(name, sub.cursor);
        }
        Ok(())
    }

    /// Clear a projection's rows and checkpoint so it replays from position 0.
    pub async fn rebuild(&mut self, name: &str) -> Result<()> {
        let sub = self
            .subscriptions
            .iter_mut()
            .find(|s| s.projector.name() == name)
            .ok_or_else(|| LedgerError::validation(format!("Unknown projection: {}", name)))?;

        sub.projector.reset().await?;
        self.checkpoints.reset(name).await?;
        sub.cursor = 0;
        sub.persisted = None;
        sub.initialized = true;

        info!(projection = name, "Projection reset for rebuild");
        Ok(())
    }

    /// Spawn the processing loop.
    ///
    /// The loop stops after its current iteration once [`ProcessorHandle::stop`]
    /// is called or the handle is dropped.
    pub fn start(mut self) -> ProcessorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let status = self.status.clone();
        let poll_interval = self.settings.poll_interval;
        let mut appended = self
            .settings
            .use_append_signal
            .then(|| self.store.subscribe());

        let join = tokio::spawn(async move {
            info!(
                projections = ?self.projection_names(),
                poll_interval = ?poll_interval,
                "Event processor started"
            );

            loop {
                if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
                    break;
                }

                // Mark the current head as seen before fetching, so an append
                // landing mid-iteration still wakes the next wait.
                if let Some(rx) = appended.as_mut() {
                    rx.borrow_and_update();
                }

                let wait = match self.run_once().await {
                    Ok(report) => !report.made_progress(),
                    Err(err) => {
                        err.log();
                        true
                    }
                };
                if !wait {
                    continue;
                }

                self.status.set_state(ProcessorState::Waiting);
                let signal_closed = tokio::select! {
                    _ = shutdown_rx.changed() => false,
                    _ = tokio::time::sleep(poll_interval) => false,
                    open = next_append(&mut appended) => !open,
                };
                if signal_closed {
                    appended = None;
                }
            }

            self.status.set_state(ProcessorState::Idle);
            info!(position = self.last_processed_position(), "Event processor stopped");
        });

        ProcessorHandle {
            shutdown: shutdown_tx,
            status,
            join,
        }
    }
}

/// Resolves on the next append; `false` once the store side is gone.
async fn next_append(signal: &mut Option<watch::Receiver<u64>>) -> bool {
    match signal {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for controlling a running processor.
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    status: ProcessorStatus,
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Ask the loop to stop and wait for the in-flight iteration to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|e| LedgerError::internal(format!("event processor task failed: {}", e)))
    }

    pub fn state(&self) -> ProcessorState {
        self.status.state()
    }

    /// `last_processed_position` as of the last completed iteration.
    pub fn position(&self) -> u64 {
        self.status.position()
    }

    pub fn status(&self) -> &ProcessorStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
