use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::context::RunContext;
use crate::error::AppError;
use crate::isolation::spawner_for;
use crate::pool::{Crash, Replacement, Spawner, WorkerPool};
use crate::task::{DeadLetter, Task, TaskResult};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: Vec<TaskResult>,
    pub dead_letters: Vec<DeadLetter>,
    /// Crashes observed over the whole run.
    pub crashes: u32,
    /// Crash count per worker id.
    pub worker_crashes: BTreeMap<usize, u32>,
    /// Units started, replacements included.
    pub spawns: usize,
    /// Tasks still pending when a cancelled run stopped.
    pub unfinished: Vec<Task>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Owns the pool for one run: starts the workers, watches them, settles the
/// tasks of crashed workers, replaces them, and decides when the run is over.
pub struct Supervisor {
    ctx: RunContext,
    spawner: Option<Arc<dyn Spawner>>,
    crashes: u32,
}

impl Supervisor {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            spawner: None,
            crashes: 0,
        }
    }

    /// Use `spawner` instead of the one the isolation model selects.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Enqueue the initial tasks.
    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        self.ctx.queue.extend(tasks);
    }

    /// Run until the queue is empty and no worker is running, or until the
    /// run is cancelled.
    ///
    /// Operation failures never fail the run. Spawn failures and an exceeded
    /// restart limit do: the remaining workers are stopped and joined before
    /// the error is returned.
    pub async fn run(mut self) -> Result<RunReport, AppError> {
        let started = Instant::now();
        self.ctx.config.validate()?;

        let spawner = match self.spawner.take() {
            Some(spawner) => spawner,
            None => spawner_for(&self.ctx)?,
        };
        let mut pool = WorkerPool::new(spawner, self.ctx.config.restart_limit);

        if self.ctx.queue.is_drained() {
            tracing::info!("Nothing to do, task queue is empty");
            return Ok(self.report(&pool, Vec::new(), started));
        }

        tracing::info!(
            workers = self.ctx.config.worker_count,
            isolation = %self.ctx.config.isolation,
            seeded = self.ctx.queue.size(),
            "Starting run"
        );

        if let Err(e) = self.supervise(&mut pool).await {
            tracing::error!(error = %e, "Run aborted");
            self.ctx.cancel.cancel();
            pool.join_all().await;
            return Err(e);
        }

        pool.join_all().await;
        self.settle_crashes(&mut pool);

        let unfinished = if self.ctx.cancel.is_cancelled() {
            self.ctx.queue.drain_pending()
        } else {
            Vec::new()
        };
        let report = self.report(&pool, unfinished, started);
        tracing::info!(
            results = report.results.len(),
            dead_letters = report.dead_letters.len(),
            crashes = report.crashes,
            spawns = report.spawns,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }

    async fn supervise(&mut self, pool: &mut WorkerPool) -> Result<(), AppError> {
        for id in 1..=self.ctx.config.worker_count {
            pool.spawn(id)?;
        }

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            // Settle first: a crashed worker's task must be back in the
            // queue before the stop condition is checked.
            self.settle_crashes(pool);

            if self.ctx.queue.is_empty() && !pool.any_active() {
                return Ok(());
            }
            if self.ctx.cancel.is_cancelled() {
                tracing::info!("Run cancelled, waiting for workers to finish their tasks");
                return Ok(());
            }

            if !self.ctx.queue.is_empty() {
                for id in pool.crashed() {
                    if let Replacement::Respawned(unsettled) = pool.replace(id)? {
                        if let Some(crash) = unsettled {
                            self.settle(crash);
                        }
                        tracing::info!(worker_id = id, "Replaced crashed worker");
                    }
                }
            }

            tracing::trace!(
                pending = self.ctx.queue.size(),
                in_progress = self.ctx.queue.in_progress(),
                "Supervisor tick"
            );

            tokio::select! {
                _ = ticker.tick() => {}
                () = self.ctx.cancel.cancelled() => {}
            }
        }
    }

    fn settle_crashes(&mut self, pool: &mut WorkerPool) {
        for id in pool.reapable() {
            if let Some(crash) = pool.reap(id) {
                self.settle(crash);
            }
        }
    }

    /// Requeue or dead-letter the task a crashed worker was holding.
    fn settle(&mut self, crash: Crash) {
        self.crashes += 1;
        let Crash {
            worker_id,
            task,
            failure,
        } = crash;
        let error = failure.unwrap_or_else(|| "worker crashed".to_string());

        let Some(task) = task else {
            tracing::warn!(crash = self.crashes, %worker_id, %error, "Worker crashed without a task");
            return;
        };

        tracing::warn!(
            crash = self.crashes,
            %worker_id,
            task_id = %task.id,
            operation = %task.operation,
            attempt = task.attempt,
            %error,
            "Worker crashed"
        );

        if self.ctx.config.retry.should_requeue(task.attempt) {
            self.ctx.queue.requeue(task.next_attempt());
        } else {
            tracing::warn!(task_id = %task.id, attempts = task.attempt, "Giving up on task");
            self.ctx.dead_letters.append(DeadLetter {
                task,
                error,
                failed_at: Utc::now(),
            });
            self.ctx.queue.task_done();
        }
    }

    fn report(&self, pool: &WorkerPool, unfinished: Vec<Task>, started: Instant) -> RunReport {
        RunReport {
            results: self.ctx.results.snapshot(),
            dead_letters: self.ctx.dead_letters.snapshot(),
            crashes: self.crashes,
            worker_crashes: pool.crash_counts(),
            spawns: pool.total_spawns(),
            unfinished,
            cancelled: self.ctx.cancel.is_cancelled(),
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{CrashPolicy, IsolationModel, ProcessCommand, RunConfig};
    use crate::operation::OperationRegistry;
    use crate::testutil::{FailingOperation, FanOutOperation, RecordOperation, SleepOperation};

    fn config(workers: usize) -> RunConfig {
        RunConfig::default()
            .with_worker_count(workers)
            .with_poll_interval(Duration::from_millis(50))
            .with_pop_timeout(Duration::from_millis(20))
    }

    fn items(count: u32) -> Vec<Task> {
        (0..count)
            .map(|n| Task::new("item").with_param("n", n))
            .collect()
    }

    fn recorded_ns(report: &RunReport) -> Vec<u64> {
        let mut ns: Vec<u64> = report
            .results
            .iter()
            .map(|r| r.data["n"].as_u64().unwrap())
            .collect();
        ns.sort_unstable();
        ns
    }

    fn fourth_call_fails(policy: CrashPolicy) -> Supervisor {
        let mut registry = OperationRegistry::new();
        registry.register("item", FailingOperation::on_nth(4, RecordOperation));
        let ctx = RunContext::new(config(3).with_crash_policy(policy), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed(items(10));
        supervisor
    }

    #[tokio::test]
    async fn crash_with_requeue_loses_nothing() {
        let report = fourth_call_fails(CrashPolicy::Requeue).run().await.unwrap();

        assert_eq!(recorded_ns(&report), (0..10).collect::<Vec<_>>());
        assert!(report.dead_letters.is_empty());
        assert_eq!(report.crashes, 1);
        assert_eq!(report.worker_crashes.values().sum::<u32>(), 1);
        assert_eq!(report.worker_crashes.values().filter(|c| **c == 1).count(), 1);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn crash_with_abandon_dead_letters_the_task() {
        let report = fourth_call_fails(CrashPolicy::Abandon).run().await.unwrap();

        assert_eq!(report.results.len(), 9);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.crashes, 1);

        let recorded: HashSet<u64> = recorded_ns(&report).into_iter().collect();
        let lost: u64 = report.dead_letters[0].task.params.get("n").unwrap();
        assert!(!recorded.contains(&lost));
        assert_eq!(recorded.len(), 9);
    }

    #[tokio::test]
    async fn run_ends_within_two_poll_intervals_of_exhaustion() {
        let mut registry = OperationRegistry::new();
        registry.register("item", RecordOperation);
        let ctx = RunContext::new(config(3), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed(items(10));

        let report = supervisor.run().await.unwrap();
        assert_eq!(report.results.len(), 10);
        // The work itself is near-instant.
        assert!(report.elapsed < Duration::from_millis(50 * 2 + 250));
        assert_eq!(report.spawns, 3);
    }

    #[tokio::test]
    async fn empty_seed_terminates_immediately() {
        let ctx = RunContext::new(config(3), OperationRegistry::new());
        let report = Supervisor::new(ctx).run().await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.spawns, 0);
        assert_eq!(report.crashes, 0);
        assert!(report.elapsed < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn fan_out_is_followed_to_the_end() {
        let mut registry = OperationRegistry::new();
        registry
            .register("list", FanOutOperation::new("item", 5))
            .register("item", RecordOperation);
        let ctx = RunContext::new(config(3), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed([Task::new("list"), Task::new("list")]);

        let report = supervisor.run().await.unwrap();
        assert_eq!(report.results.len(), 10);
        assert!(report.results.iter().all(|r| r.operation.as_str() == "item"));
    }

    #[tokio::test]
    async fn slow_producer_keeps_the_run_alive() {
        // The queue is empty for several poll intervals while the only
        // listing sleeps; the run must wait for its children anyway.
        let mut registry = OperationRegistry::new();
        registry
            .register(
                "list",
                FanOutOperation::new("item", 5).with_delay(Duration::from_millis(300)),
            )
            .register("item", RecordOperation);
        let ctx = RunContext::new(config(3), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed([Task::new("list")]);

        let report = supervisor.run().await.unwrap();
        assert_eq!(recorded_ns(&report), (0..5).collect::<Vec<_>>());
        assert_eq!(report.spawns, 3);
        assert_eq!(report.crashes, 0);
        assert!(report.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn always_failing_task_is_dead_lettered_after_max_attempts() {
        let mut registry = OperationRegistry::new();
        registry.register("fail", FailingOperation::always());
        let ctx = RunContext::new(config(1).with_max_attempts(3), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed([Task::new("fail")]);

        let report = supervisor.run().await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].task.attempt, 3);
        assert_eq!(report.crashes, 3);
        assert_eq!(report.worker_crashes.get(&1), Some(&3));
        assert_eq!(report.spawns, 3);
    }

    #[tokio::test]
    async fn crash_does_not_disturb_other_workers() {
        let mut registry = OperationRegistry::new();
        registry
            .register("item", RecordOperation)
            .register("fail", FailingOperation::always());
        let ctx = RunContext::new(config(3).with_crash_policy(CrashPolicy::Abandon), registry);
        let supervisor = Supervisor::new(ctx);
        supervisor.seed(items(3));
        supervisor.seed([Task::new("fail")]);
        supervisor.seed(items(3).into_iter().map(|t| t.with_param("n", 10)));

        let report = supervisor.run().await.unwrap();
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].task.operation.as_str(), "fail");
    }

    #[tokio::test]
    async fn restart_limit_aborts_the_run() {
        let mut registry = OperationRegistry::new();
        registry.register("fail", FailingOperation::always());
        let config = config(1)
            .with_max_attempts(10)
            .with_restart_limit(Some(1));
        let supervisor = Supervisor::new(RunContext::new(config, registry));
        supervisor.seed([Task::new("fail")]);

        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, AppError::RestartLimitExceeded { worker_id: 1, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn cancellation_stops_the_run_and_reports_leftovers() {
        let mut registry = OperationRegistry::new();
        registry.register("slow", SleepOperation::new(Duration::from_millis(40)));
        let cancel = CancellationToken::new();
        let ctx = RunContext::with_cancellation(config(1), registry, cancel.clone());
        let supervisor = Supervisor::new(ctx);
        supervisor.seed((0..20).map(|n| Task::new("slow").with_param("n", n)));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });
        let report = supervisor.run().await.unwrap();
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert!(!report.results.is_empty());
        assert!(!report.unfinished.is_empty());
        assert_eq!(report.results.len() + report.unfinished.len(), 20);
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fatal_error_does_not_cancel_the_callers_token() {
        let parent = CancellationToken::new();
        let config = config(2)
            .with_isolation(IsolationModel::Process)
            .with_worker_command(ProcessCommand::new("/nonexistent/harvest-worker-binary"));
        let ctx = RunContext::with_cancellation(config, OperationRegistry::new(), parent.clone());
        let supervisor = Supervisor::new(ctx);
        supervisor.seed([Task::new("item")]);

        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, AppError::SpawnFailure { worker_id: 1, .. }));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_spawning() {
        let ctx = RunContext::new(config(0), OperationRegistry::new());
        let supervisor = Supervisor::new(ctx);
        supervisor.seed(items(1));
        assert!(matches!(
            supervisor.run().await.unwrap_err(),
            AppError::ConfigError(_)
        ));
    }
}
