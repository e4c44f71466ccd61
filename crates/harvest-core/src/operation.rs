use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::task::{OperationId, Params, Task, TaskId};

/// A task body: the behaviour a [`Task`] triggers when a worker executes it.
///
/// Operations may enqueue any number of follow-up tasks and record at most
/// one result through the context. Both are committed only if `run`
/// returns `Ok`; a failing invocation leaves no trace in the queue or sink.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError>;
}

/// What an operation sees of the run while it executes one task.
#[derive(Debug)]
pub struct TaskContext {
    task_id: TaskId,
    operation: OperationId,
    attempt: u32,
    worker_id: usize,
    spawned: Vec<Task>,
    result: Option<serde_json::Value>,
}

impl TaskContext {
    pub fn new(task: &Task, worker_id: usize) -> Self {
        Self {
            task_id: task.id,
            operation: task.operation.clone(),
            attempt: task.attempt,
            worker_id,
            spawned: Vec::new(),
            result: None,
        }
    }

    /// Queue a follow-up task (fan-out).
    pub fn enqueue(&mut self, task: Task) {
        self.spawned.push(task);
    }

    /// Record this task's result. May be called once.
    pub fn record<T: Serialize>(&mut self, value: &T) -> Result<(), AppError> {
        if self.result.is_some() {
            return Err(AppError::Generic(format!(
                "task {} recorded a result twice",
                self.task_id
            )));
        }
        self.result = Some(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    /// Which delivery of the task this is (1 on first try).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn into_completion(self) -> Completion {
        Completion {
            spawned: self.spawned,
            result: self.result,
        }
    }
}

/// The committed effects of a successful invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub spawned: Vec<Task>,
    pub result: Option<serde_json::Value>,
}

/// Operations by id. Built before the pool starts and shared read-only.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<OperationId, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<OperationId>,
        operation: impl Operation + 'static,
    ) -> &mut Self {
        self.register_arc(id, Arc::new(operation))
    }

    pub fn register_arc(
        &mut self,
        id: impl Into<OperationId>,
        operation: Arc<dyn Operation>,
    ) -> &mut Self {
        let id = id.into();
        if self.operations.insert(id.clone(), operation).is_some() {
            tracing::warn!(operation = %id, "Operation registered twice, keeping the last one");
        }
        self
    }

    pub fn get(&self, id: &OperationId) -> Result<Arc<dyn Operation>, AppError> {
        self.operations
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::UnknownOperation(id.clone()))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &OperationId> {
        self.operations.keys()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Run the task's operation. Panics are caught and reported as
    /// [`AppError::OperationFailed`].
    pub async fn invoke(&self, task: &Task, worker_id: usize) -> Result<Completion, AppError> {
        let operation = self.get(&task.operation)?;
        let mut ctx = TaskContext::new(task, worker_id);

        let outcome = AssertUnwindSafe(operation.run(&mut ctx, &task.params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Ok(ctx.into_completion()),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(AppError::OperationFailed {
                operation: task.operation.clone(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FailingOperation, FanOutOperation, PanickingOperation, RecordOperation};

    #[tokio::test]
    async fn invoke_commits_fan_out_and_result() {
        let mut registry = OperationRegistry::new();
        registry
            .register("list", FanOutOperation::new("item", 3))
            .register("item", RecordOperation);

        let completion = registry.invoke(&Task::new("list"), 1).await.unwrap();
        assert_eq!(completion.spawned.len(), 3);
        assert!(completion.spawned.iter().all(|t| t.operation.as_str() == "item"));
        assert!(completion.result.is_none());

        let item = Task::new("item").with_param("n", 4);
        let completion = registry.invoke(&item, 2).await.unwrap();
        assert_eq!(completion.result.unwrap()["n"], 4);
    }

    #[tokio::test]
    async fn invoke_unknown_operation_fails() {
        let registry = OperationRegistry::new();
        let err = registry.invoke(&Task::new("nope"), 1).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownOperation(id) if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn invoke_propagates_operation_errors() {
        let mut registry = OperationRegistry::new();
        registry.register("fail", FailingOperation::always());
        let err = registry.invoke(&Task::new("fail"), 1).await.unwrap_err();
        assert!(matches!(err, AppError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn invoke_catches_panics() {
        let mut registry = OperationRegistry::new();
        registry.register("panic", PanickingOperation);
        let err = registry.invoke(&Task::new("panic"), 1).await.unwrap_err();
        match err {
            AppError::OperationFailed { operation, message } => {
                assert_eq!(operation.as_str(), "panic");
                assert!(message.contains("panicked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn record_twice_is_an_error() {
        let task = Task::new("op");
        let mut ctx = TaskContext::new(&task, 1);
        ctx.record(&serde_json::json!({"a": 1})).unwrap();
        assert!(ctx.record(&serde_json::json!({"a": 2})).is_err());
        assert_eq!(ctx.into_completion().result.unwrap()["a"], 1);
    }
}
