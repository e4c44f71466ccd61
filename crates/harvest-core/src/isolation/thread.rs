use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::AppError;
use crate::pool::{ExecutionUnit, Spawner};
use crate::worker::{LocalChannel, TracingWorkerReporter, Worker, WorkerReporter, WorkerSlot, WorkerState};

/// Runs each worker on a dedicated OS thread with its own single-threaded
/// tokio runtime. All threads share the run's queue, sink and registry.
pub struct ThreadSpawner {
    ctx: RunContext,
    reporter: Arc<dyn WorkerReporter>,
}

impl ThreadSpawner {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            reporter: Arc::new(TracingWorkerReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn WorkerReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, slot: WorkerSlot) -> Result<Box<dyn ExecutionUnit>, AppError> {
        let id = slot.id();
        let channel = LocalChannel::new(
            Arc::clone(&self.ctx.queue),
            Arc::clone(&self.ctx.results),
            slot.clone(),
        );
        let worker = Worker::new(
            id,
            channel,
            Arc::clone(&self.ctx.registry),
            self.ctx.config.pop_timeout,
        );
        let reporter = Arc::clone(&self.reporter);

        let handle = std::thread::Builder::new()
            .name(format!("harvest-worker-{id}"))
            .spawn(move || {
                let state = run_on_own_runtime(&worker, reporter.as_ref(), &slot);
                slot.exit(state);
            })
            .map_err(|source| AppError::SpawnFailure {
                worker_id: id,
                source,
            })?;

        Ok(Box::new(ThreadUnit {
            handle: Some(handle),
        }))
    }
}

fn run_on_own_runtime(
    worker: &Worker<LocalChannel>,
    reporter: &dyn WorkerReporter,
    slot: &WorkerSlot,
) -> WorkerState {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            slot.crash(format!("failed to start worker runtime: {e}"));
            return WorkerState::Crashed;
        }
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(worker.run(reporter)))) {
        Ok(state) => state,
        Err(_) => {
            slot.crash("worker thread panicked");
            WorkerState::Crashed
        }
    }
}

/// A worker thread. Alive until the thread function returns.
pub struct ThreadUnit {
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl ExecutionUnit for ThreadUnit {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!("Worker thread panicked during shutdown"),
            Err(e) => tracing::warn!(error = %e, "Failed to join worker thread"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RunConfig;
    use crate::operation::OperationRegistry;
    use crate::task::Task;
    use crate::testutil::{FailingOperation, MockReporter, RecordOperation};

    fn context() -> RunContext {
        let mut registry = OperationRegistry::new();
        registry
            .register("item", RecordOperation)
            .register("fail", FailingOperation::always());
        let config = RunConfig::default().with_pop_timeout(Duration::from_millis(20));
        RunContext::new(config, registry)
    }

    async fn wait_dead(unit: &dyn ExecutionUnit) {
        for _ in 0..200 {
            if !unit.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker thread did not exit");
    }

    #[tokio::test]
    async fn thread_worker_drains_queue_and_exits_done() {
        let ctx = context();
        for n in 0..3 {
            ctx.queue.put(Task::new("item").with_param("n", n));
        }
        let reporter = MockReporter::new();
        let spawner = ThreadSpawner::new(ctx.clone()).with_reporter(Arc::new(reporter.clone()));

        let slot = WorkerSlot::new(1);
        let mut unit = spawner.spawn(slot.clone()).unwrap();
        wait_dead(unit.as_ref()).await;
        unit.join().await;

        assert_eq!(slot.state(), WorkerState::Done);
        assert_eq!(ctx.results.len(), 3);
        assert!(ctx.queue.is_drained());
        assert!(reporter.events.lock().unwrap().contains(&"Stopped".to_string()));
    }

    #[tokio::test]
    async fn failing_operation_crashes_only_that_thread() {
        let ctx = context();
        ctx.queue.put(Task::new("fail"));
        let spawner = ThreadSpawner::new(ctx.clone());

        let slot = WorkerSlot::new(2);
        let mut unit = spawner.spawn(slot.clone()).unwrap();
        wait_dead(unit.as_ref()).await;
        unit.join().await;

        assert_eq!(slot.state(), WorkerState::Crashed);
        let (task, failure) = slot.take_crash();
        assert_eq!(task.unwrap().operation.as_str(), "fail");
        assert!(failure.is_some());
        assert!(!unit.is_alive());
    }
}
