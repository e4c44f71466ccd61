use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// How each worker is isolated from the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationModel {
    /// One OS thread per worker, sharing memory with the supervisor.
    #[default]
    Thread,
    /// One child process per worker, talking to the supervisor over stdio.
    Process,
}

impl IsolationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationModel::Thread => "thread",
            IsolationModel::Process => "process",
        }
    }
}

impl fmt::Display for IsolationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IsolationModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thread" => Ok(IsolationModel::Thread),
            "process" => Ok(IsolationModel::Process),
            _ => Err(format!("Unknown isolation model: {}", s)),
        }
    }
}

/// What the supervisor does with the task a crashed worker was holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashPolicy {
    /// Put the task back in the queue, up to `max_attempts` deliveries.
    #[default]
    Requeue,
    /// Dead-letter the task immediately.
    Abandon,
}

impl CrashPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashPolicy::Requeue => "requeue",
            CrashPolicy::Abandon => "abandon",
        }
    }
}

impl fmt::Display for CrashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CrashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requeue" => Ok(CrashPolicy::Requeue),
            "abandon" => Ok(CrashPolicy::Abandon),
            _ => Err(format!("Unknown crash policy: {}", s)),
        }
    }
}

/// Per-task retry bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub policy: CrashPolicy,
    /// Total deliveries allowed per task, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: CrashPolicy::Requeue,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Whether a task that crashed on delivery `attempt` goes back in the queue.
    pub fn should_requeue(&self, attempt: u32) -> bool {
        self.policy == CrashPolicy::Requeue && attempt < self.max_attempts
    }
}

/// Program a process worker is started with.
///
/// The spawner appends `--worker-id <N>` to `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Configuration for one run of the pool.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub worker_count: usize,
    pub isolation: IsolationModel,
    /// How often the supervisor checks worker liveness.
    pub poll_interval: Duration,
    /// How long a worker blocks in `pop` before re-checking the run state.
    pub pop_timeout: Duration,
    pub retry: RetryConfig,
    /// Maximum restarts per worker id; `None` means unbounded.
    pub restart_limit: Option<u32>,
    /// Required for [`IsolationModel::Process`].
    pub worker_command: Option<ProcessCommand>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            isolation: IsolationModel::Thread,
            poll_interval: Duration::from_secs(3),
            pop_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            restart_limit: None,
            worker_command: None,
        }
    }
}

impl RunConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationModel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.retry.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_restart_limit(mut self, limit: Option<u32>) -> Self {
        self.restart_limit = limit;
        self
    }

    pub fn with_worker_command(mut self, command: ProcessCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker_count == 0 {
            return Err(AppError::ConfigError(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AppError::ConfigError(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.pop_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "pop_timeout must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.isolation == IsolationModel::Process && self.worker_command.is_none() {
            return Err(AppError::ConfigError(
                "process isolation needs a worker command".into(),
            ));
        }
        Ok(())
    }
}
