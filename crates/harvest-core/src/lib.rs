pub mod chaos;
pub mod config;
pub mod context;
pub mod error;
pub mod isolation;
pub mod operation;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod supervisor;
pub mod task;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{CrashPolicy, IsolationModel, ProcessCommand, RetryConfig, RunConfig};
pub use context::RunContext;
pub use error::AppError;
pub use operation::{Completion, Operation, OperationRegistry, TaskContext};
pub use queue::TaskQueue;
pub use sink::{DeadLetters, ResultSink};
pub use supervisor::{RunReport, Supervisor};
pub use task::{DeadLetter, OperationId, Params, Task, TaskId, TaskResult};
pub use traits::Fetcher;
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerState};
