use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::operation::{Completion, OperationRegistry};
use crate::queue::TaskQueue;
use crate::sink::ResultSink;
use crate::task::{Task, TaskId, TaskResult};

/// Lifecycle of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Running,
    /// Exited because no more work will appear (or the run was cancelled).
    Done,
    /// Exited because an operation failed, or the unit died.
    Crashed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Done => "done",
            WorkerState::Crashed => "crashed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Done | WorkerState::Crashed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Default)]
struct SlotInner {
    state: WorkerState,
    in_flight: Option<Task>,
    failure: Option<String>,
}

/// Shared, supervisor-readable state of one execution unit.
///
/// The unit (or, for processes, its parent-side proxy) writes it; the
/// supervisor reads it. A fresh slot is created for every spawn, so a
/// replaced unit can never overwrite its successor's state.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    id: usize,
    inner: Arc<Mutex<SlotInner>>,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(SlotInner::default())),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn lock_inner(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(worker_id = self.id, "Recovered from poisoned worker slot");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> WorkerState {
        self.lock_inner().state
    }

    pub fn in_flight(&self) -> Option<Task> {
        self.lock_inner().in_flight.clone()
    }

    /// The unit took `task` off the queue.
    pub fn begin(&self, task: Task) {
        self.lock_inner().in_flight = Some(task);
    }

    /// The in-flight task was settled.
    pub fn finish(&self) {
        self.lock_inner().in_flight = None;
    }

    /// Mark the unit crashed. The in-flight task stays for the supervisor.
    pub fn crash(&self, failure: impl Into<String>) {
        let mut inner = self.lock_inner();
        inner.state = WorkerState::Crashed;
        inner.failure = Some(failure.into());
    }

    /// Record how the unit exited. A crash already recorded wins, and so does
    /// a task still in flight: a unit that exits holding a task crashed.
    pub fn exit(&self, state: WorkerState) {
        let mut inner = self.lock_inner();
        if inner.state == WorkerState::Crashed {
            return;
        }
        inner.state = if inner.in_flight.is_some() {
            if inner.failure.is_none() {
                inner.failure = Some("worker exited while holding a task".into());
            }
            WorkerState::Crashed
        } else {
            state
        };
    }

    /// Take the in-flight task and failure message of a crashed unit.
    pub fn take_crash(&self) -> (Option<Task>, Option<String>) {
        let mut inner = self.lock_inner();
        (inner.in_flight.take(), inner.failure.take())
    }
}

/// Answer to a worker asking for its next task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pull {
    Task { task: Task },
    /// Nothing arrived within the timeout, but work may still appear.
    Idle,
    /// The queue is drained: no more work will ever appear.
    Drained,
    Cancelled,
}

/// How a worker reaches the shared queue and sink.
///
/// Thread workers talk to them directly ([`LocalChannel`]); process workers
/// go through the stdio protocol. The worker loop is the same for both.
#[async_trait]
pub trait WorkChannel: Send + Sync {
    async fn pull(&self, timeout: Duration) -> Result<Pull, AppError>;

    /// Commit the effects of a successful task.
    async fn complete(&self, task: &Task, completion: Completion) -> Result<(), AppError>;

    /// Report that the task failed. The task is not settled.
    async fn fail(&self, task: &Task, error: &str) -> Result<(), AppError>;
}

/// Commit a completion into the shared queue and sink.
///
/// The result goes in before the fan-out is released, and the in-flight
/// marker is cleared last, so a crash report never loses a committed task.
pub(crate) fn commit_completion(
    queue: &TaskQueue,
    results: &ResultSink,
    slot: &WorkerSlot,
    task: &Task,
    completion: Completion,
) {
    if let Some(data) = completion.result {
        results.append(TaskResult {
            task_id: task.id,
            operation: task.operation.clone(),
            worker_id: slot.id(),
            data,
            completed_at: Utc::now(),
        });
    }
    queue.complete(completion.spawned);
    slot.finish();
}

/// In-process channel used by thread workers.
pub struct LocalChannel {
    queue: Arc<TaskQueue>,
    results: Arc<ResultSink>,
    slot: WorkerSlot,
}

impl LocalChannel {
    pub fn new(queue: Arc<TaskQueue>, results: Arc<ResultSink>, slot: WorkerSlot) -> Self {
        Self {
            queue,
            results,
            slot,
        }
    }
}

/// Turn an empty `pop` into the right [`Pull`] signal.
pub(crate) fn empty_pull(queue: &TaskQueue) -> Pull {
    if queue.is_cancelled() {
        Pull::Cancelled
    } else if queue.is_drained() {
        Pull::Drained
    } else {
        Pull::Idle
    }
}

#[async_trait]
impl WorkChannel for LocalChannel {
    async fn pull(&self, timeout: Duration) -> Result<Pull, AppError> {
        match self.queue.pop(timeout).await {
            Some(task) => {
                self.slot.begin(task.clone());
                Ok(Pull::Task { task })
            }
            None => Ok(empty_pull(&self.queue)),
        }
    }

    async fn complete(&self, task: &Task, completion: Completion) -> Result<(), AppError> {
        commit_completion(&self.queue, &self.results, &self.slot, task, completion);
        Ok(())
    }

    async fn fail(&self, _task: &Task, error: &str) -> Result<(), AppError> {
        self.slot.crash(error);
        Ok(())
    }
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: usize,
    },
    Polling {
        worker_id: usize,
    },
    TaskStarted {
        worker_id: usize,
        task: &'a Task,
    },
    TaskCompleted {
        worker_id: usize,
        task_id: TaskId,
        spawned: usize,
        recorded: bool,
    },
    TaskFailed {
        worker_id: usize,
        task: &'a Task,
        error: &'a str,
    },
    Stopped {
        worker_id: usize,
        state: WorkerState,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling for tasks");
            }
            WorkerEvent::TaskStarted { worker_id, task } => {
                tracing::info!(
                    %worker_id,
                    task_id = %task.id,
                    operation = %task.operation,
                    attempt = task.attempt,
                    "Performing task"
                );
            }
            WorkerEvent::TaskCompleted {
                worker_id,
                task_id,
                spawned,
                recorded,
            } => {
                tracing::debug!(%worker_id, %task_id, %spawned, %recorded, "Task completed");
            }
            WorkerEvent::TaskFailed {
                worker_id,
                task,
                error,
            } => {
                tracing::warn!(
                    %worker_id,
                    task_id = %task.id,
                    operation = %task.operation,
                    %error,
                    "Task failed, worker crashing"
                );
            }
            WorkerEvent::Stopped { worker_id, state } => {
                tracing::info!(%worker_id, %state, "Worker stopped");
            }
        }
    }
}

/// The pull loop run by every execution unit.
pub struct Worker<C: WorkChannel> {
    id: usize,
    channel: C,
    registry: Arc<OperationRegistry>,
    pop_timeout: Duration,
}

impl<C: WorkChannel> Worker<C> {
    pub fn new(
        id: usize,
        channel: C,
        registry: Arc<OperationRegistry>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            id,
            channel,
            registry,
            pop_timeout,
        }
    }

    /// Run until the queue is drained (`Done`), the run is cancelled (`Done`)
    /// or an operation fails (`Crashed`).
    pub async fn run<WR: WorkerReporter + ?Sized>(&self, reporter: &WR) -> WorkerState {
        reporter.report(WorkerEvent::Started { worker_id: self.id });
        let state = self.pull_loop(reporter).await;
        reporter.report(WorkerEvent::Stopped {
            worker_id: self.id,
            state,
        });
        state
    }

    async fn pull_loop<WR: WorkerReporter + ?Sized>(&self, reporter: &WR) -> WorkerState {
        loop {
            let task = match self.channel.pull(self.pop_timeout).await {
                Ok(Pull::Task { task }) => task,
                Ok(Pull::Idle) => {
                    reporter.report(WorkerEvent::Polling { worker_id: self.id });
                    continue;
                }
                Ok(Pull::Drained) | Ok(Pull::Cancelled) => return WorkerState::Done,
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Lost contact with the task queue");
                    return WorkerState::Crashed;
                }
            };

            reporter.report(WorkerEvent::TaskStarted {
                worker_id: self.id,
                task: &task,
            });

            match self.registry.invoke(&task, self.id).await {
                Ok(completion) => {
                    let spawned = completion.spawned.len();
                    let recorded = completion.result.is_some();
                    if let Err(e) = self.channel.complete(&task, completion).await {
                        tracing::error!(worker_id = self.id, task_id = %task.id, error = %e, "Failed to commit task");
                        return WorkerState::Crashed;
                    }
                    reporter.report(WorkerEvent::TaskCompleted {
                        worker_id: self.id,
                        task_id: task.id,
                        spawned,
                        recorded,
                    });
                }
                Err(e) => {
                    let error = e.to_string();
                    reporter.report(WorkerEvent::TaskFailed {
                        worker_id: self.id,
                        task: &task,
                        error: &error,
                    });
                    if let Err(e) = self.channel.fail(&task, &error).await {
                        tracing::error!(worker_id = self.id, task_id = %task.id, error = %e, "Failed to report task failure");
                    }
                    return WorkerState::Crashed;
                }
            }
        }
    }
}
