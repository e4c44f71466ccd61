//! Test utilities: hand-written operations, spawners and mocks.
//!
//! Shared state lives behind `Arc<Mutex<_>>` (or atomics) so tests can
//! assert on what happened after the fact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppError;
use crate::operation::{Operation, TaskContext};
use crate::pool::{ExecutionUnit, Spawner};
use crate::task::{Params, Task};
use crate::traits::Fetcher;
use crate::worker::{WorkerEvent, WorkerReporter, WorkerSlot, WorkerState};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Records its params as the task result.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOperation;

#[async_trait]
impl Operation for RecordOperation {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        ctx.record(params)
    }
}

/// Enqueues `count` tasks of `child` with params `{"n": 0..count}`.
/// Records nothing.
#[derive(Debug, Clone)]
pub struct FanOutOperation {
    child: String,
    count: usize,
    delay: Duration,
}

impl FanOutOperation {
    pub fn new(child: &str, count: usize) -> Self {
        Self {
            child: child.to_string(),
            count,
            delay: Duration::ZERO,
        }
    }

    /// Sleep for `delay` before enqueueing the children.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Operation for FanOutOperation {
    async fn run(&self, ctx: &mut TaskContext, _params: &Params) -> Result<(), AppError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for n in 0..self.count {
            ctx.enqueue(Task::new(self.child.as_str()).with_param("n", n));
        }
        Ok(())
    }
}

/// Fails every call, or only the nth call across all workers and otherwise
/// delegates to an inner operation.
#[derive(Clone)]
pub struct FailingOperation {
    fail_on: Option<usize>,
    inner: Option<Arc<dyn Operation>>,
    calls: Arc<AtomicUsize>,
}

impl FailingOperation {
    pub fn always() -> Self {
        Self {
            fail_on: None,
            inner: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the `n`th call (1-based) only.
    pub fn on_nth(n: usize, inner: impl Operation + 'static) -> Self {
        Self {
            fail_on: Some(n),
            inner: Some(Arc::new(inner)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation for FailingOperation {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fails = self.fail_on.is_none_or(|n| n == call);
        if fails {
            // Effects staged before the failure must be discarded.
            ctx.enqueue(Task::new("never.committed"));
            return Err(AppError::OperationFailed {
                operation: ctx.operation().clone(),
                message: format!("forced failure on call {call}"),
            });
        }
        match &self.inner {
            Some(inner) => inner.run(ctx, params).await,
            None => Ok(()),
        }
    }
}

/// Panics on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingOperation;

#[async_trait]
impl Operation for PanickingOperation {
    async fn run(&self, _ctx: &mut TaskContext, _params: &Params) -> Result<(), AppError> {
        panic!("operation exploded");
    }
}

/// Sleeps, then records its params.
#[derive(Debug, Clone, Copy)]
pub struct SleepOperation {
    delay: Duration,
}

impl SleepOperation {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Operation for SleepOperation {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        tokio::time::sleep(self.delay).await;
        ctx.record(params)
    }
}

// ---------------------------------------------------------------------------
// ManualSpawner
// ---------------------------------------------------------------------------

/// An execution unit driven by the test instead of a thread or process.
#[derive(Clone)]
pub struct ManualUnit {
    slot: WorkerSlot,
    alive: Arc<AtomicBool>,
}

impl ManualUnit {
    pub fn slot(&self) -> &WorkerSlot {
        &self.slot
    }

    /// Die with a failure, keeping any in-flight task on the slot.
    pub fn crash(&self, failure: &str) {
        self.slot.crash(failure);
        self.slot.exit(WorkerState::Crashed);
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Exit cleanly.
    pub fn finish(&self) {
        self.slot.exit(WorkerState::Done);
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionUnit for ManualUnit {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn join(&mut self) {}
}

/// Spawner handing out [`ManualUnit`]s and remembering them per worker id.
#[derive(Clone, Default)]
pub struct ManualSpawner {
    units: Arc<Mutex<HashMap<usize, Vec<ManualUnit>>>>,
    fail_next: Arc<AtomicBool>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest unit spawned for `id`.
    pub fn unit(&self, id: usize) -> ManualUnit {
        let units = self.units.lock().unwrap();
        units
            .get(&id)
            .and_then(|spawned| spawned.last())
            .cloned()
            .unwrap_or_else(|| panic!("no unit spawned for worker {id}"))
    }

    pub fn spawned_for(&self, id: usize) -> usize {
        self.units.lock().unwrap().get(&id).map_or(0, Vec::len)
    }

    /// Make the next spawn fail like a missing executable would.
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, slot: WorkerSlot) -> Result<Box<dyn ExecutionUnit>, AppError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::SpawnFailure {
                worker_id: slot.id(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            });
        }
        let unit = ManualUnit {
            slot: slot.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        };
        self.units
            .lock()
            .unwrap()
            .entry(slot.id())
            .or_default()
            .push(unit.clone());
        Ok(Box::new(unit))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records the name of every worker event.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling { .. } => "Polling",
            WorkerEvent::TaskStarted { .. } => "TaskStarted",
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted",
            WorkerEvent::TaskFailed { .. } => "TaskFailed",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher serving canned pages by URL and recording every request.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pages: Arc<Mutex<HashMap<String, String>>>,
    error: Arc<Mutex<Option<AppError>>>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
        self
    }

    /// Fail the next request with `error`.
    pub fn with_error(self, error: AppError) -> Self {
        *self.error.lock().unwrap() = Some(error);
        self
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.requests.lock().unwrap().push(url.to_string());
        if let Some(error) = self.error.lock().unwrap().take() {
            return Err(error);
        }
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::HttpError(format!("HTTP 404 for {url}")))
    }
}
