//! Supervising dispatcher for research executions.
//!
//! One execution unit runs per task, tracked by task id. The unit is the only
//! writer of a task's progress; terminal status writes are compare-and-set,
//! so whichever of completion, failure or cancellation lands first wins and
//! is the only one broadcast.

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use db::models::research_task::{
    CreateResearchTask, ProgressUpdate, ReportType, ResearchResult, ResearchShape, ResearchStatus,
    ResearchTask, ResearchTaskError,
};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    time::Instant,
};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::services::{
    config::{DispatcherConfig, LimitsConfig},
    estimate,
    execution_control::ExecutionControl,
    progress_bus::ProgressBus,
    research_engine::{EngineError, EngineOutput, EngineRequest, ProgressSink, ResearchEngine},
    research_events::{CANCELLED_BY_USER, ResearchEvent},
};

pub const SHUTDOWN_REASON: &str = "server shutting down";

// Retry interval while a pause is still propagating to the run control.
const PAUSE_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("Research task not found")]
    NotFound,
    #[error("Cannot {action} a research task that is {status}")]
    InvalidState {
        status: ResearchStatus,
        action: &'static str,
    },
    #[error("Research task {0} already has a live execution")]
    AlreadyRunning(Uuid),
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl DispatchError {
    fn from_task(err: ResearchTaskError, action: &'static str) -> Self {
        match err {
            ResearchTaskError::Database(e) => DispatchError::Database(e),
            ResearchTaskError::NotFound => DispatchError::NotFound,
            ResearchTaskError::InvalidTransition { from, .. } => DispatchError::InvalidState {
                status: from,
                action,
            },
        }
    }
}

/// Pause and resume hold `commands` across the record write and the run
/// control update, so both always end in the same state.
#[derive(Clone)]
struct LiveExecution {
    control: ExecutionControl,
    commands: Arc<Mutex<()>>,
}

impl LiveExecution {
    fn new() -> Self {
        Self {
            control: ExecutionControl::new(),
            commands: Arc::new(Mutex::new(())),
        }
    }
}

struct DispatcherInner {
    pool: SqlitePool,
    bus: ProgressBus,
    engine: Arc<dyn ResearchEngine>,
    limits: LimitsConfig,
    settings: DispatcherConfig,
    executions: DashMap<Uuid, LiveExecution>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ResearchDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ResearchDispatcher {
    pub fn new(
        pool: SqlitePool,
        bus: ProgressBus,
        engine: Arc<dyn ResearchEngine>,
        limits: LimitsConfig,
        settings: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_executions.max(1)));
        Self {
            inner: Arc::new(DispatcherInner {
                pool,
                bus,
                engine,
                limits,
                settings,
                executions: DashMap::new(),
                tracker: TaskTracker::new(),
                permits,
            }),
        }
    }

    pub fn validate(&self, data: &CreateResearchTask) -> Result<(), DispatchError> {
        let limits = &self.inner.limits;
        let query_chars = data.query.trim().chars().count();

        if query_chars == 0 {
            return Err(DispatchError::Validation("query must not be empty".to_string()));
        }
        if query_chars < limits.min_query_chars || query_chars > limits.max_query_chars {
            return Err(DispatchError::Validation(format!(
                "query must be between {} and {} characters",
                limits.min_query_chars, limits.max_query_chars
            )));
        }
        if data.max_subtopics < limits.min_subtopics || data.max_subtopics > limits.max_subtopics {
            return Err(DispatchError::Validation(format!(
                "max_subtopics must be between {} and {}",
                limits.min_subtopics, limits.max_subtopics
            )));
        }
        if data.total_words < limits.min_total_words || data.total_words > limits.max_total_words {
            return Err(DispatchError::Validation(format!(
                "total_words must be between {} and {}",
                limits.min_total_words, limits.max_total_words
            )));
        }
        if data.tone.trim().is_empty() || data.language.trim().is_empty() {
            return Err(DispatchError::Validation(
                "tone and language must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates, persists a `pending` task and starts its execution unit.
    /// Returns as soon as the record exists.
    pub async fn submit(&self, data: CreateResearchTask) -> Result<ResearchTask, DispatchError> {
        self.validate(&data)?;
        if self.inner.tracker.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }

        let shape = match data.report_type {
            ReportType::Deep => ResearchShape {
                total_depth: self.inner.limits.deep_total_depth,
                total_breadth: self.inner.limits.deep_total_breadth,
            },
            _ => ResearchShape::default(),
        };

        let task = ResearchTask::create(&self.inner.pool, &data, Uuid::new_v4(), shape)
            .await
            .map_err(|e| DispatchError::from_task(e, "create"))?;
        tracing::info!(
            "[DISPATCHER] Created research task {} ({})",
            task.id,
            task.report_type
        );

        if let Err(e) = self.launch(&task) {
            if matches!(e, DispatchError::ShuttingDown)
                && let Err(cancel_err) =
                    ResearchTask::cancel(&self.inner.pool, task.id, SHUTDOWN_REASON).await
            {
                tracing::debug!(
                    "[DISPATCHER] Task {} not cancelled at shutdown: {}",
                    task.id,
                    cancel_err
                );
            }
            return Err(e);
        }
        Ok(task)
    }

    /// Starts the execution unit for a pending task.
    pub fn launch(&self, task: &ResearchTask) -> Result<(), DispatchError> {
        let live = LiveExecution::new();
        let control = live.control.clone();
        match self.inner.executions.entry(task.id) {
            Entry::Occupied(_) => return Err(DispatchError::AlreadyRunning(task.id)),
            Entry::Vacant(slot) => {
                slot.insert(live);
            }
        }

        // Checked after registering: a shutdown either snapshots this entry or
        // has already closed the tracker.
        if self.inner.tracker.is_closed() {
            self.inner
                .executions
                .remove_if(&task.id, |_, current| current.control.same_as(&control));
            return Err(DispatchError::ShuttingDown);
        }

        let dispatcher = self.clone();
        let task = task.clone();
        self.inner.tracker.spawn(async move {
            let task_id = task.id;
            dispatcher.run_execution(task, control.clone()).await;
            dispatcher
                .inner
                .executions
                .remove_if(&task_id, |_, current| current.control.same_as(&control));
        });
        Ok(())
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<ResearchTask, DispatchError> {
        self.cancel_with_reason(task_id, CANCELLED_BY_USER).await
    }

    /// Cancels a pending, running or paused task and publishes the terminal event.
    pub async fn cancel_with_reason(
        &self,
        task_id: Uuid,
        reason: &str,
    ) -> Result<ResearchTask, DispatchError> {
        let task = ResearchTask::cancel(&self.inner.pool, task_id, reason)
            .await
            .map_err(|e| DispatchError::from_task(e, "cancel"))?;

        if let Some(live) = self.live_execution(task_id) {
            live.control.cancel();
        }
        tracing::info!("[DISPATCHER] Research task {} cancelled: {}", task_id, reason);

        self.inner.bus.broadcast(
            task_id,
            ResearchEvent::Cancelled {
                task_id,
                reason: reason.to_string(),
            },
        );
        Ok(task)
    }

    pub async fn pause(&self, task_id: Uuid) -> Result<ResearchTask, DispatchError> {
        let live = self.require_live(task_id, "pause").await?;
        let _commands = live.commands.lock().await;
        let task = ResearchTask::transition(&self.inner.pool, task_id, ResearchStatus::Paused)
            .await
            .map_err(|e| DispatchError::from_task(e, "pause"))?;

        if let Err(e) = live.control.pause() {
            tracing::debug!("[DISPATCHER] Run control for {} not paused: {}", task_id, e);
        }
        tracing::info!("[DISPATCHER] Research task {} paused", task_id);
        self.inner
            .bus
            .broadcast(task_id, ResearchEvent::Paused { task_id });
        Ok(task)
    }

    /// Resumes a paused task. A queued task is only ever started by its own
    /// execution unit, so resuming it is an invalid state.
    pub async fn resume(&self, task_id: Uuid) -> Result<ResearchTask, DispatchError> {
        let live = self.require_live(task_id, "resume").await?;
        let _commands = live.commands.lock().await;
        let task = ResearchTask::resume(&self.inner.pool, task_id)
            .await
            .map_err(|e| DispatchError::from_task(e, "resume"))?;

        if let Err(e) = live.control.resume() {
            tracing::debug!("[DISPATCHER] Run control for {} not resumed: {}", task_id, e);
        }
        tracing::info!("[DISPATCHER] Research task {} resumed", task_id);
        self.inner
            .bus
            .broadcast(task_id, ResearchEvent::Resumed { task_id });
        Ok(task)
    }

    /// Stops accepting work, cancels every live execution and waits for the
    /// units to wind down.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();

        let live: Vec<Uuid> = self
            .inner
            .executions
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for task_id in live {
            if let Err(e) = self.cancel_with_reason(task_id, SHUTDOWN_REASON).await {
                tracing::debug!("[DISPATCHER] Task {} not cancelled at shutdown: {}", task_id, e);
            }
        }

        self.inner.tracker.wait().await;
        tracing::info!("[DISPATCHER] All research executions stopped");
    }

    pub fn execution_count(&self) -> usize {
        self.inner.executions.len()
    }

    pub fn is_executing(&self, task_id: Uuid) -> bool {
        self.inner.executions.contains_key(&task_id)
    }

    fn live_execution(&self, task_id: Uuid) -> Option<LiveExecution> {
        self.inner
            .executions
            .get(&task_id)
            .map(|entry| entry.value().clone())
    }

    async fn require_live(
        &self,
        task_id: Uuid,
        action: &'static str,
    ) -> Result<LiveExecution, DispatchError> {
        if let Some(live) = self.live_execution(task_id) {
            return Ok(live);
        }
        match ResearchTask::find_by_id(&self.inner.pool, task_id).await? {
            Some(task) => Err(DispatchError::InvalidState {
                status: task.status,
                action,
            }),
            None => Err(DispatchError::NotFound),
        }
    }

    async fn run_execution(&self, task: ResearchTask, control: ExecutionControl) {
        let task_id = task.id;

        let _permit = tokio::select! {
            biased;
            _ = control.cancelled() => {
                tracing::debug!("[DISPATCHER] Task {} cancelled while queued", task_id);
                return;
            }
            permit = self.inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let started =
            ResearchTask::transition(&self.inner.pool, task_id, ResearchStatus::Running).await;
        let task = match started {
            Ok(task) => task,
            Err(ResearchTaskError::InvalidTransition { from, .. }) => {
                tracing::info!("[DISPATCHER] Task {} is {}, not starting it", task_id, from);
                return;
            }
            Err(e) => {
                tracing::error!("[DISPATCHER] Failed to start task {}: {}", task_id, e);
                return;
            }
        };

        tracing::info!("[DISPATCHER] Research task {} running", task_id);
        let estimate = estimate::estimate(task.report_type, &task.query);
        self.inner.bus.broadcast(
            task_id,
            ResearchEvent::Started {
                task_id,
                estimated_time_minutes: estimate.estimated_time_minutes,
            },
        );

        let (sink, mut progress_rx) = ProgressSink::new(control.clone());
        let engine = self.inner.engine.clone();
        let request = EngineRequest::from(&task);
        let work = async move {
            let handle = engine.begin(request, sink).await?;
            handle.await_result().await
        };

        let Some(outcome) = self.drive(task_id, &control, work, &mut progress_rx).await else {
            return;
        };

        while let Ok(update) = progress_rx.try_recv() {
            self.record_progress(task_id, &control, update).await;
        }

        match outcome {
            Ok(output) => self.finish_completed(task_id, &control, output).await,
            Err(EngineError::Cancelled) if control.is_cancelled() => {
                tracing::debug!("[DISPATCHER] Engine for task {} stopped after cancel", task_id);
            }
            Err(e) => self.finish_failed(task_id, &control, e.to_string()).await,
        }
    }

    /// Runs the engine work while applying its progress. Enforces the
    /// wall-clock timeout and abandons an engine that ignores cancellation
    /// for longer than the grace period.
    async fn drive<W>(
        &self,
        task_id: Uuid,
        control: &ExecutionControl,
        work: W,
        progress_rx: &mut mpsc::UnboundedReceiver<ProgressUpdate>,
    ) -> Option<Result<EngineOutput, EngineError>>
    where
        W: Future<Output = Result<EngineOutput, EngineError>>,
    {
        tokio::pin!(work);

        let timeout_secs = self.inner.settings.task_timeout_secs;
        let deadline = timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        let grace = Duration::from_secs(self.inner.settings.cancel_grace_secs);
        let mut timed_out = false;
        let mut abandon_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                Some(update) = progress_rx.recv() => {
                    self.record_progress(task_id, control, update).await;
                }
                result = &mut work => return Some(result),
                _ = sleep_until(deadline), if !timed_out && deadline.is_some() => {
                    timed_out = true;
                    let secs = timeout_secs.unwrap_or_default();
                    tracing::warn!(
                        "[DISPATCHER] Research task {} timed out after {}s",
                        task_id,
                        secs
                    );
                    let reason = format!("timed out after {secs} seconds");
                    if let Err(e) = self.cancel_with_reason(task_id, &reason).await {
                        tracing::debug!(
                            "[DISPATCHER] Timeout cancel for {} skipped: {}",
                            task_id,
                            e
                        );
                    }
                }
                _ = control.cancelled(), if abandon_at.is_none() => {
                    abandon_at = Some(Instant::now() + grace);
                }
                _ = sleep_until(abandon_at), if abandon_at.is_some() => {
                    tracing::warn!(
                        "[DISPATCHER] Engine for task {} ignored cancellation, abandoning it",
                        task_id
                    );
                    return None;
                }
            }
        }
    }

    /// Counters are always merged. The event is not broadcast once the run
    /// is cancelled; the check happens under the bus lock, and cancellation
    /// flips the control before publishing `cancelled`.
    async fn record_progress(
        &self,
        task_id: Uuid,
        control: &ExecutionControl,
        update: ProgressUpdate,
    ) {
        if !update.is_empty()
            && let Err(e) = ResearchTask::apply_progress(&self.inner.pool, task_id, &update).await
        {
            tracing::warn!("[DISPATCHER] Failed to record progress for {}: {}", task_id, e);
        }
        self.inner.bus.broadcast_if(
            task_id,
            ResearchEvent::Progress {
                task_id,
                data: update,
            },
            || !control.is_cancelled(),
        );
    }

    async fn finish_completed(
        &self,
        task_id: Uuid,
        control: &ExecutionControl,
        output: EngineOutput,
    ) {
        let pool = &self.inner.pool;
        let result: ResearchResult = output.into();
        let result = &result;
        let written = settle(control, move || ResearchTask::complete(pool, task_id, result)).await;

        match written {
            None => tracing::debug!(
                "[DISPATCHER] Result for task {} discarded after cancel",
                task_id
            ),
            Some(Ok(task)) => {
                tracing::info!(
                    "[DISPATCHER] Research task {} completed (cost ${:.2})",
                    task_id,
                    task.cost
                );
                if let Some(event) = ResearchEvent::terminal_for(&task) {
                    self.inner.bus.broadcast(task_id, event);
                }
            }
            Some(Err(ResearchTaskError::InvalidTransition { from, .. })) => {
                tracing::info!(
                    "[DISPATCHER] Task {} already {}, discarding engine result",
                    task_id,
                    from
                );
            }
            Some(Err(e)) => {
                tracing::error!("[DISPATCHER] Failed to store result for {}: {}", task_id, e);
                self.finish_failed(task_id, control, format!("failed to store result: {e}"))
                    .await;
            }
        }
    }

    async fn finish_failed(&self, task_id: Uuid, control: &ExecutionControl, message: String) {
        let pool = &self.inner.pool;
        let msg = message.as_str();
        let written = settle(control, move || ResearchTask::fail(pool, task_id, msg)).await;

        match written {
            None => tracing::debug!(
                "[DISPATCHER] Failure of task {} ignored after cancel",
                task_id
            ),
            Some(Ok(_)) => {
                tracing::error!("[DISPATCHER] Research task {} failed: {}", task_id, message);
                self.inner.bus.broadcast(
                    task_id,
                    ResearchEvent::Error {
                        task_id,
                        error: message,
                    },
                );
            }
            Some(Err(ResearchTaskError::InvalidTransition { from, .. })) => {
                tracing::info!(
                    "[DISPATCHER] Task {} already {}, dropping failure: {}",
                    task_id,
                    from,
                    message
                );
            }
            Some(Err(e)) => {
                tracing::error!("[DISPATCHER] Failed to mark task {} failed: {}", task_id, e);
            }
        }
    }
}

/// Applies a terminal write once the run is not paused. `None` means the
/// run was cancelled first.
async fn settle<F, Fut>(
    control: &ExecutionControl,
    write: F,
) -> Option<Result<ResearchTask, ResearchTaskError>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<ResearchTask, ResearchTaskError>>,
{
    loop {
        control.checkpoint().await.ok()?;
        match write().await {
            Err(ResearchTaskError::InvalidTransition {
                from: ResearchStatus::Paused,
                ..
            }) => tokio::time::sleep(PAUSE_SETTLE).await,
            other => return Some(other),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
