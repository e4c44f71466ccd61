//! Process isolation: one child process per worker.
//!
//! The parent keeps the real queue and sink. For every child it runs a proxy
//! task that answers the child's requests and remembers which task the child
//! is holding, so a child killed mid-task still has its task recovered.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, Stdin, Stdout};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ProcessCommand;
use crate::context::RunContext;
use crate::error::AppError;
use crate::isolation::protocol::{SupervisorMessage, WorkerMessage, read_message, write_message};
use crate::operation::{Completion, OperationRegistry};
use crate::pool::{ExecutionUnit, Spawner};
use crate::queue::TaskQueue;
use crate::sink::ResultSink;
use crate::task::{Task, TaskId};
use crate::worker::{
    Pull, TracingWorkerReporter, WorkChannel, Worker, WorkerSlot, WorkerState, commit_completion,
    empty_pull,
};

/// Starts workers as child processes of `command`, with `--worker-id <N>`
/// appended.
pub struct ProcessSpawner {
    ctx: RunContext,
    command: ProcessCommand,
}

impl ProcessSpawner {
    pub fn new(ctx: RunContext, command: ProcessCommand) -> Self {
        Self { ctx, command }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, slot: WorkerSlot) -> Result<Box<dyn ExecutionUnit>, AppError> {
        let id = slot.id();
        let spawn_failure = |source| AppError::SpawnFailure {
            worker_id: id,
            source,
        };

        let mut child = tokio::process::Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("--worker-id")
            .arg(id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failure)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_failure(std::io::Error::other(
                "child stdio was not captured",
            )));
        };
        tracing::debug!(worker_id = id, pid = ?child.id(), "Started worker process");

        let queue = Arc::clone(&self.ctx.queue);
        let results = Arc::clone(&self.ctx.results);
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut writer = stdin;
            let served = serve(&mut reader, &mut writer, &slot, &queue, &results).await;
            drop(writer);
            settle_child(child, served, &slot).await;
        });

        Ok(Box::new(ProcessUnit {
            handle: Some(handle),
        }))
    }
}

/// Answer one child's requests until it closes its stdout.
pub(crate) async fn serve<R, W>(
    reader: &mut R,
    writer: &mut W,
    slot: &WorkerSlot,
    queue: &TaskQueue,
    results: &ResultSink,
) -> Result<(), AppError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = read_message::<_, WorkerMessage>(reader).await? {
        match message {
            WorkerMessage::Pull { timeout_ms } => {
                if let Some(held) = slot.in_flight() {
                    return Err(AppError::ProtocolError(format!(
                        "pull while task {} is still in flight",
                        held.id
                    )));
                }
                let reply = match queue.pop(Duration::from_millis(timeout_ms)).await {
                    Some(task) => {
                        // Recorded before the reply: if the write fails the
                        // task is recovered with the crash.
                        slot.begin(task.clone());
                        SupervisorMessage::Task { task }
                    }
                    None => empty_pull(queue),
                };
                write_message(writer, &reply).await?;
            }
            WorkerMessage::Complete {
                task_id,
                completion,
            } => {
                let task = expect_in_flight(slot, task_id)?;
                commit_completion(queue, results, slot, &task, completion);
            }
            WorkerMessage::Fail { task_id, error } => {
                expect_in_flight(slot, task_id)?;
                slot.crash(error);
            }
        }
    }
    Ok(())
}

fn expect_in_flight(slot: &WorkerSlot, task_id: TaskId) -> Result<Task, AppError> {
    match slot.in_flight() {
        Some(task) if task.id == task_id => Ok(task),
        Some(task) => Err(AppError::ProtocolError(format!(
            "worker reported task {task_id} but holds {}",
            task.id
        ))),
        None => Err(AppError::ProtocolError(format!(
            "worker reported task {task_id} but holds none"
        ))),
    }
}

/// Reap the child and record how the unit ended.
async fn settle_child(mut child: Child, served: Result<(), AppError>, slot: &WorkerSlot) {
    let id = slot.id();
    if let Err(e) = served {
        tracing::warn!(worker_id = id, error = %e, "Worker process broke protocol, killing it");
        slot.crash(format!("protocol error: {e}"));
        if let Err(e) = child.start_kill() {
            tracing::debug!(worker_id = id, error = %e, "Worker process already gone");
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => slot.exit(WorkerState::Done),
        Ok(status) => {
            if slot.state() != WorkerState::Crashed {
                slot.crash(format!("worker process exited with {status}"));
            }
            slot.exit(WorkerState::Crashed);
        }
        Err(e) => {
            slot.crash(format!("failed to wait for worker process: {e}"));
            slot.exit(WorkerState::Crashed);
        }
    }
}

/// A worker process, seen through its proxy task.
pub struct ProcessUnit {
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Worker process proxy failed");
        }
    }
}

/// Child side of the protocol: a [`WorkChannel`] over a reader/writer pair.
pub struct RemoteChannel<R, W> {
    io: Mutex<(BufReader<R>, W)>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> RemoteChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((BufReader::new(reader), writer)),
        }
    }
}

impl RemoteChannel<Stdin, Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> WorkChannel for RemoteChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn pull(&self, timeout: Duration) -> Result<Pull, AppError> {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        write_message(writer, &WorkerMessage::Pull { timeout_ms }).await?;
        read_message(reader)
            .await?
            .ok_or_else(|| AppError::ProtocolError("supervisor closed the channel".into()))
    }

    async fn complete(&self, task: &Task, completion: Completion) -> Result<(), AppError> {
        let mut io = self.io.lock().await;
        let message = WorkerMessage::Complete {
            task_id: task.id,
            completion,
        };
        write_message(&mut io.1, &message).await
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<(), AppError> {
        let mut io = self.io.lock().await;
        let message = WorkerMessage::Fail {
            task_id: task.id,
            error: error.to_string(),
        };
        write_message(&mut io.1, &message).await
    }
}

/// Entry point of a worker child: run the pull loop over stdin/stdout.
pub async fn run_worker_process(
    worker_id: usize,
    registry: OperationRegistry,
    pop_timeout: Duration,
) -> WorkerState {
    let worker = Worker::new(
        worker_id,
        RemoteChannel::stdio(),
        Arc::new(registry),
        pop_timeout,
    );
    worker.run(&TracingWorkerReporter).await
}
