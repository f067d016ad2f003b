//! Bounded-parallelism scheduler for download tasks.
//!
//! Dispatch happens under the pool lock whenever something changes (a
//! submission, a finished task, a raised limit), so there is no polling loop.
//! Each dispatched task gets its own worker thread for its whole lifetime.

use crate::config::clamp_concurrency;
use crate::events::LogLevel;
use crate::executor::{EngineContext, Reporter, TaskExecutor};
use crate::models::{DownloadRequest, DownloadStatus, RowToken, TaskId};
use crate::task::{CancelToken, DownloadTask, TaskHandle, TaskOutcome};
use crate::validation::validate_request;
use crate::{EngineError, Result};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const POOL_SOURCE: &str = "pool";
/// Outcomes nobody takes are dropped oldest first beyond this many.
const MAX_RETAINED_OUTCOMES: usize = 1024;

struct PoolState {
    limit: usize,
    active: usize,
    queue: VecDeque<DownloadTask>,
    /// Cancel flags of every queued or running task.
    tokens: HashMap<TaskId, CancelToken>,
    outcomes: HashMap<TaskId, TaskOutcome>,
    outcome_order: VecDeque<TaskId>,
    outcome_capacity: usize,
    shut_down: bool,
}

impl PoolState {
    fn record_outcome(&mut self, id: TaskId, outcome: TaskOutcome) {
        if self.outcomes.insert(id, outcome).is_none() {
            self.outcome_order.push_back(id);
        }
        while self.outcome_order.len() > self.outcome_capacity {
            let Some(oldest) = self.outcome_order.pop_front() else {
                break;
            };
            if self.outcomes.remove(&oldest).is_some() {
                tracing::debug!(task_id = %oldest, "dropped untaken outcome");
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.queue.is_empty()
    }
}

struct PoolShared {
    ctx: Arc<EngineContext>,
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Accepts download requests and runs at most `concurrency_limit()` of them
/// at a time, first come first served.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let limit = ctx.config.clamped_concurrency();
        Self {
            shared: Arc::new(PoolShared {
                ctx,
                state: Mutex::new(PoolState {
                    limit,
                    active: 0,
                    queue: VecDeque::new(),
                    tokens: HashMap::new(),
                    outcomes: HashMap::new(),
                    outcome_order: VecDeque::new(),
                    outcome_capacity: MAX_RETAINED_OUTCOMES,
                    shut_down: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.shared.ctx
    }

    /// Validates and enqueues a request. Never blocks on running tasks.
    pub fn submit(&self, request: DownloadRequest, row: Option<RowToken>) -> Result<TaskHandle> {
        validate_request(&request)?;

        let task = DownloadTask::new(request, row);
        let handle = task.handle();

        let mut state = self.shared.lock();
        if state.shut_down {
            return Err(EngineError::PoolShutDown);
        }
        // Published under the lock so `Pending` precedes anything a worker emits.
        Reporter::new(&self.shared.ctx.bus, task.task_ref(), POOL_SOURCE).status(DownloadStatus::Pending);
        tracing::debug!(task_id = %task.id(), url = %task.request().url, "task queued");

        state.tokens.insert(task.id(), task.cancel_token().clone());
        state.queue.push_back(task);
        dispatch(&self.shared, &mut state);
        Ok(handle)
    }

    /// Applies to future dispatch decisions only; running tasks are never
    /// preempted.
    pub fn set_concurrency_limit(&self, limit: usize) -> usize {
        let limit = clamp_concurrency(limit);
        let mut state = self.shared.lock();
        state.limit = limit;
        dispatch(&self.shared, &mut state);
        limit
    }

    pub fn concurrency_limit(&self) -> usize {
        self.shared.lock().limit
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Queued tasks are cancelled on the spot; running tasks get their flag
    /// set and stop at their next checkpoint.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(pos) = state.queue.iter().position(|t| t.id() == id) {
            if let Some(task) = state.queue.remove(pos) {
                finish_unstarted(&self.shared, &mut state, task);
                self.shared.idle.notify_all();
            }
            return Ok(());
        }
        if let Some(token) = state.tokens.get(&id) {
            token.cancel();
            return Ok(());
        }
        if state.outcomes.contains_key(&id) {
            return Ok(());
        }
        Err(EngineError::UnknownTask(id.to_string()))
    }

    /// Returns the number of tasks that were flagged.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.shared.lock();
        cancel_all_locked(&self.shared, &mut state)
    }

    /// Removes and returns the outcome of a finished task. Only the most
    /// recent untaken outcomes are retained.
    pub fn take_outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        let mut state = self.shared.lock();
        let outcome = state.outcomes.remove(&id)?;
        state.outcome_order.retain(|queued| *queued != id);
        Some(outcome)
    }

    /// Blocks until nothing is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }

    /// Stops accepting submissions, cancels everything and waits up to
    /// `timeout` for running tasks to drain.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.lock();
            state.shut_down = true;
            let flagged = cancel_all_locked(&self.shared, &mut state);
            tracing::info!(flagged, "worker pool shutting down");
        }
        self.wait_idle(timeout)
    }
}

fn cancel_all_locked(shared: &Arc<PoolShared>, state: &mut PoolState) -> usize {
    let flagged = state.tokens.len();
    for token in state.tokens.values() {
        token.cancel();
    }
    let queued: Vec<DownloadTask> = state.queue.drain(..).collect();
    for task in queued {
        finish_unstarted(shared, state, task);
    }
    shared.idle.notify_all();
    flagged
}

/// Finalizes a task that never got a slot. The executor's pre-start check
/// turns it into `Cancelled` without touching the engine.
fn finish_unstarted(shared: &Arc<PoolShared>, state: &mut PoolState, task: DownloadTask) {
    task.cancel_token().cancel();
    let id = task.id();
    let outcome = TaskExecutor::new(Arc::clone(&shared.ctx)).execute(task);
    state.tokens.remove(&id);
    state.record_outcome(id, outcome);
}

fn dispatch(shared: &Arc<PoolShared>, state: &mut PoolState) {
    while state.active < state.limit {
        let Some(task) = state.queue.pop_front() else {
            break;
        };
        if task.is_cancel_requested() {
            finish_unstarted(shared, state, task);
            shared.idle.notify_all();
            continue;
        }

        let id = task.id();
        let task_ref = task.task_ref();
        state.active += 1;

        let worker = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("download-{id}"))
            .spawn(move || run_task(worker, task));

        if let Err(e) = spawned {
            tracing::error!(task_id = %id, error = %e, "failed to spawn worker thread");
            state.active -= 1;
            state.tokens.remove(&id);
            let message = format!("failed to start worker thread: {e}");
            let reporter = Reporter::new(&shared.ctx.bus, task_ref, POOL_SOURCE);
            reporter.log(LogLevel::Error, message.clone());
            reporter.status(DownloadStatus::Failed);
            reporter.completed(DownloadStatus::Failed, Some(message.clone()));
            state.record_outcome(id, failed_outcome(task_ref.id, task_ref.row, message));
            shared.idle.notify_all();
        }
    }
}

fn run_task(shared: Arc<PoolShared>, task: DownloadTask) {
    let task_ref = task.task_ref();
    let executor = TaskExecutor::new(Arc::clone(&shared.ctx));
    let outcome = match catch_unwind(AssertUnwindSafe(|| executor.execute(task))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = format!("task panicked: {}", panic_message(panic.as_ref()));
            tracing::error!(task_id = %task_ref.id, error = %message, "task panicked");
            let reporter = Reporter::new(&shared.ctx.bus, task_ref, POOL_SOURCE);
            reporter.log(LogLevel::Error, message.clone());
            reporter.status(DownloadStatus::Failed);
            reporter.completed(DownloadStatus::Failed, Some(message.clone()));
            failed_outcome(task_ref.id, task_ref.row, message)
        }
    };

    let mut state = shared.lock();
    state.active -= 1;
    state.tokens.remove(&task_ref.id);
    state.record_outcome(task_ref.id, outcome);
    dispatch(&shared, &mut state);
    shared.idle.notify_all();
}

fn failed_outcome(id: TaskId, row: Option<RowToken>, message: String) -> TaskOutcome {
    TaskOutcome {
        id,
        row,
        status: DownloadStatus::Failed,
        error: Some(message),
        info: None,
        retry: None,
        output_dir: None,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
