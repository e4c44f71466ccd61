use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::operation::OperationRegistry;
use crate::queue::TaskQueue;
use crate::sink::{DeadLetters, ResultSink};

/// Everything one run shares: the queue, the sinks, the operations,
/// the configuration and the cancellation token.
///
/// Built once per run and handed to the pool, the supervisor and every
/// worker. Cloning is cheap.
#[derive(Clone)]
pub struct RunContext {
    pub queue: Arc<TaskQueue>,
    pub results: Arc<ResultSink>,
    pub dead_letters: Arc<DeadLetters>,
    pub registry: Arc<OperationRegistry>,
    pub config: RunConfig,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: RunConfig, registry: OperationRegistry) -> Self {
        Self::with_cancellation(config, registry, CancellationToken::new())
    }

    /// Build a context observing an externally owned token (e.g. Ctrl-C).
    ///
    /// The run holds a child of `parent`: cancelling the run (for instance
    /// after a fatal error) leaves the caller's token untouched.
    pub fn with_cancellation(
        config: RunConfig,
        registry: OperationRegistry,
        parent: CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        Self {
            queue: Arc::new(TaskQueue::new(cancel.clone())),
            results: Arc::new(ResultSink::new()),
            dead_letters: Arc::new(DeadLetters::new()),
            registry: Arc::new(registry),
            config,
            cancel,
        }
    }
}
