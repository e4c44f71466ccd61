use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Stable name under which an operation is registered (e.g. `"catalogue.book"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for OperationId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Correlation id for a task. Used in logs and dead-letter reports only;
/// it carries no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 8 hex chars are plenty for log correlation.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Opaque operation parameters. The core never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(serde_json::Map<String, serde_json::Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Deserialize a required parameter.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, AppError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| AppError::invalid_params(format!("missing param '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| AppError::invalid_params(format!("param '{key}': {e}")))
    }

    /// Deserialize an optional parameter; `null` counts as absent.
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match self.0.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => self.get(key).map(Some),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<serde_json::Value> for Params {
    type Error = AppError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            serde_json::Value::Null => Ok(Self::default()),
            other => Err(AppError::invalid_params(format!(
                "params must be a JSON object, got {other}"
            ))),
        }
    }
}

/// An enqueued unit of work: which operation to run and what it needs.
///
/// Tasks are values. A requeued task is a new value with the same id,
/// operation and params and the next attempt number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub operation: OperationId,
    pub params: Params,
    /// 1 on first delivery, incremented on every requeue after a crash.
    pub attempt: u32,
}

impl Task {
    pub fn new(operation: impl Into<OperationId>) -> Self {
        Self {
            id: TaskId::new(),
            operation: operation.into(),
            params: Params::new(),
            attempt: 1,
        }
    }

    /// Build a task from a JSON object of params.
    pub fn from_json(
        operation: impl Into<OperationId>,
        params: serde_json::Value,
    ) -> Result<Self, AppError> {
        Ok(Self {
            params: Params::try_from(params)?,
            ..Self::new(operation)
        })
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// The copy that goes back into the queue after a crash.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// One entry in the result sink, appended when a task completes successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub operation: OperationId,
    pub worker_id: usize,
    pub data: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// A task that will not be attempted again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
