use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, error, info, info_span};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::StudioError;
use crate::runtime::executor::{ExecutionError, Executor, ProgressReporter};
use crate::runtime::slots::{WorkerPermit, WorkerSlots};
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{TaskId, TaskMutation, TaskRecord, TaskStatus};

/// Point-in-time view of the queue and the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Task ids waiting for a worker slot.
    pub queue_size: usize,
    /// Tasks currently held by a worker.
    pub active: usize,
    pub max_concurrent: usize,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Whether the dispatch loop is currently running.
    pub is_processing: bool,
}

#[derive(Debug)]
struct ActiveWorker {
    cancel_tx: watch::Sender<bool>,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    active: HashMap<TaskId, ActiveWorker>,
    running: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    clock: SharedClock,
    slots: WorkerSlots,
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

/// FIFO task scheduler with a bounded worker pool.
///
/// Tasks are dispatched in creation order to at most
/// `max_concurrent_tasks` workers. The dispatch loop is started on demand by
/// [`Scheduler::create`] and parks itself after an idle poll interval with an
/// empty queue and no active workers.
///
/// # Usage
///
/// ```rust,ignore
/// let scheduler = Scheduler::new(store, executor, clock, SchedulerConfig::default());
/// let id = scheduler.create(record).await?;
/// let status = scheduler.queue_status().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        let slots = WorkerSlots::new(config.max_concurrent_tasks);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                clock,
                slots,
                config,
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Persist a freshly built `Pending` record and queue it for execution.
    pub async fn create(&self, record: TaskRecord) -> Result<TaskId, StudioError> {
        if self.inner.state.lock().shutdown {
            return Err(StudioError::SchedulerShutdown);
        }
        let id = record.id();
        let kind = record.kind();
        self.inner.store.insert(record).await?;
        self.enqueue(id);
        info!(task_id = %id, %kind, "task queued");
        Ok(id)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StudioError> {
        self.inner.store.get(id).await
    }

    pub async fn list_user_tasks(&self, user_id: &str, limit: usize) -> Result<Vec<TaskRecord>, StudioError> {
        self.inner.store.list_for_user(user_id, limit).await
    }

    /// Record a progress checkpoint, optionally with a status change.
    pub async fn update_progress(
        &self,
        id: TaskId,
        progress: i32,
        status: Option<TaskStatus>,
    ) -> Result<TaskRecord, StudioError> {
        self.inner
            .store
            .apply(id, TaskMutation::Progress { progress, status }, self.inner.clock.now())
            .await
    }

    /// Mark a running task completed.
    ///
    /// The task leaves the active registry and its worker is stopped, which
    /// frees the slot. Later worker transitions on it are rejected.
    pub async fn complete(&self, id: TaskId, result: serde_json::Value) -> Result<TaskRecord, StudioError> {
        let task = self
            .inner
            .store
            .apply(id, TaskMutation::Complete { result }, self.inner.clock.now())
            .await?;
        self.inner.stop_worker(id);
        Ok(task)
    }

    /// Mark a running task failed. Same registry handling as [`Scheduler::complete`].
    pub async fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<TaskRecord, StudioError> {
        let task = self
            .inner
            .store
            .apply(
                id,
                TaskMutation::Fail {
                    error: error.into(),
                },
                self.inner.clock.now(),
            )
            .await?;
        self.inner.stop_worker(id);
        Ok(task)
    }

    /// Cancel a task.
    ///
    /// A `Pending` task is cancelled immediately and will never be executed.
    /// For a `Processing` task the worker is signalled and the task becomes
    /// `Cancelled` once the worker observes it. Returns `false` for unknown
    /// or terminal tasks and for repeated requests.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, StudioError> {
        let Some(task) = self.inner.store.get(id).await? else {
            return Ok(false);
        };
        match task.status() {
            TaskStatus::Pending => {
                match self
                    .inner
                    .store
                    .apply(id, TaskMutation::Withdraw, self.inner.clock.now())
                    .await
                {
                    Ok(_) => {
                        self.inner.state.lock().pending.retain(|queued| *queued != id);
                        info!(task_id = %id, "pending task cancelled");
                        Ok(true)
                    }
                    // Lost the race against dispatch; the task is running now.
                    Err(StudioError::InvalidTransition { .. }) => Ok(self.inner.signal_cancel(id)),
                    Err(err) => Err(err),
                }
            }
            TaskStatus::Processing => Ok(self.inner.signal_cancel(id)),
            _ => Ok(false),
        }
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, StudioError> {
        let counts = self.inner.store.counts().await?;
        let state = self.inner.state.lock();
        Ok(QueueStatus {
            queue_size: state.pending.len(),
            active: state.active.len(),
            max_concurrent: self.inner.slots.capacity(),
            total: counts.total,
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            is_processing: state.running,
        })
    }

    /// Oldest completion time that is still retained.
    pub fn retention_cutoff(&self) -> DateTime<Utc> {
        self.inner.clock.now() - self.inner.config.retention()
    }

    /// Remove terminal tasks older than the retention window.
    pub async fn cleanup(&self) -> Result<usize, StudioError> {
        let cutoff = self.retention_cutoff();
        let removed = self.inner.store.remove_terminal_before(cutoff).await?;
        if removed > 0 {
            info!(removed, %cutoff, "expired tasks removed");
        }
        Ok(removed)
    }

    /// Stop dispatching. Queued tasks stay `Pending`; running workers finish.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.slots.close();
        self.inner.wakeup.notify_one();
        info!("scheduler shut down");
    }

    fn enqueue(&self, id: TaskId) {
        let start_loop = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(id);
            !std::mem::replace(&mut state.running, true)
        };
        self.inner.wakeup.notify_one();
        if start_loop {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_loop().await });
        }
    }
}

enum Outcome {
    Finished(Result<serde_json::Value, ExecutionError>),
    Cancelled,
}

impl Inner {
    /// Dispatch loop: one slot, then one task, in FIFO order.
    async fn run_loop(self: Arc<Self>) {
        debug!("dispatch loop started");
        loop {
            let permit = match self.slots.acquire().await {
                Ok(permit) => permit,
                // Slots are only closed by shutdown.
                Err(_) => {
                    self.state.lock().running = false;
                    break;
                }
            };
            match tokio::time::timeout(self.config.idle_poll_interval(), self.next_pending()).await {
                Ok(Some(id)) => Arc::clone(&self).dispatch(id, permit).await,
                Ok(None) => break,
                Err(_) => {
                    drop(permit);
                    if self.park_if_idle() {
                        break;
                    }
                }
            }
        }
        debug!("dispatch loop parked");
    }

    async fn next_pending(&self) -> Option<TaskId> {
        loop {
            let notified = self.wakeup.notified();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    state.running = false;
                    return None;
                }
                if let Some(id) = state.pending.pop_front() {
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Clear the running flag if there is nothing left to do.
    ///
    /// Checked under the same lock `enqueue` pushes under, so a task created
    /// concurrently either keeps this loop alive or starts a new one.
    fn park_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.active.is_empty() {
            state.running = false;
            true
        } else {
            false
        }
    }

    async fn dispatch(self: Arc<Self>, id: TaskId, permit: WorkerPermit) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Registered before the task turns `Processing` so a concurrent
        // cancel always finds a worker to signal.
        self.state.lock().active.insert(
            id,
            ActiveWorker {
                cancel_tx,
                cancel_requested: false,
            },
        );

        let record = match self.store.apply(id, TaskMutation::Start, self.clock.now()).await {
            Ok(record) => record,
            Err(err) => {
                self.state.lock().active.remove(&id);
                debug!(task_id = %id, error = %err, "queued task skipped");
                return;
            }
        };

        let span = info_span!("task", task_id = %id, kind = %record.kind());
        tokio::spawn(
            async move {
                self.run_worker(record, cancel_rx).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    async fn run_worker(&self, record: TaskRecord, cancel_rx: watch::Receiver<bool>) {
        let id = record.id();
        info!("task started");
        let outcome = self.drive(&record, cancel_rx).await;

        let cancel_requested = self.retire(id);
        let mutation = match outcome {
            _ if cancel_requested => TaskMutation::Cancel,
            Outcome::Cancelled => TaskMutation::Cancel,
            Outcome::Finished(Ok(result)) => TaskMutation::Complete { result },
            Outcome::Finished(Err(err)) => TaskMutation::Fail {
                error: err.to_string(),
            },
        };

        match self.store.apply(id, mutation, self.clock.now()).await {
            Ok(task) => match task.error() {
                Some(error) => error!(status = %task.status(), %error, "task finished"),
                None => info!(status = %task.status(), "task finished"),
            },
            Err(err) => debug!(error = %err, "task already finalized"),
        }
    }

    /// Progress checkpoints around a single guarded executor call.
    async fn drive(&self, record: &TaskRecord, mut cancel_rx: watch::Receiver<bool>) -> Outcome {
        let id = record.id();
        self.checkpoint(id, 10).await;
        let reporter = ProgressReporter::new(id, Arc::clone(&self.store), Arc::clone(&self.clock));
        self.checkpoint(id, ProgressReporter::BAND_START).await;

        let limit = self.config.execution_timeout();
        let execution = AssertUnwindSafe(tokio::time::timeout(
            limit,
            self.executor.execute(record, &reporter),
        ))
        .catch_unwind();

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => return Outcome::Cancelled,
            result = execution => match result {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(ExecutionError::Timeout(limit.as_secs())),
                Err(panic) => Err(ExecutionError::Failed(panic_message(&*panic))),
            },
        };

        if result.is_ok() {
            self.checkpoint(id, ProgressReporter::BAND_END).await;
        }
        Outcome::Finished(result)
    }

    async fn checkpoint(&self, id: TaskId, progress: i32) {
        let mutation = TaskMutation::Progress {
            progress,
            status: None,
        };
        if let Err(err) = self.store.apply(id, mutation, self.clock.now()).await {
            debug!(task_id = %id, progress, error = %err, "checkpoint skipped");
        }
    }

    /// Drop the worker entry. Returns whether cancellation was requested.
    fn retire(&self, id: TaskId) -> bool {
        self.state
            .lock()
            .active
            .remove(&id)
            .is_some_and(|worker| worker.cancel_requested)
    }

    /// Drop the worker entry of a task finalized from outside and interrupt
    /// its execution.
    fn stop_worker(&self, id: TaskId) {
        if let Some(worker) = self.state.lock().active.remove(&id) {
            let _ = worker.cancel_tx.send(true);
            debug!(task_id = %id, "worker stopped after external finalization");
        }
    }

    /// Signal a running worker. `true` only for the first request.
    fn signal_cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        match state.active.get_mut(&id) {
            Some(worker) if !worker.cancel_requested => {
                worker.cancel_requested = true;
                let _ = worker.cancel_tx.send(true);
                info!(task_id = %id, "cancellation requested");
                true
            }
            _ => false,
        }
    }
}

/// Resolves once cancellation has been signalled; never resolves otherwise.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("executor panicked: {msg}")
    } else {
        "executor panicked".to_owned()
    }
}
