//! Execution-unit backends for the worker pool.

pub mod process;
pub mod protocol;
pub mod thread;

use std::sync::Arc;

use crate::config::IsolationModel;
use crate::context::RunContext;
use crate::error::AppError;
use crate::pool::Spawner;

pub use process::{ProcessSpawner, RemoteChannel, run_worker_process};
pub use thread::ThreadSpawner;

/// Pick the spawner for the configured isolation model.
pub fn spawner_for(ctx: &RunContext) -> Result<Arc<dyn Spawner>, AppError> {
    match ctx.config.isolation {
        IsolationModel::Thread => Ok(Arc::new(ThreadSpawner::new(ctx.clone()))),
        IsolationModel::Process => {
            let command = ctx.config.worker_command.clone().ok_or_else(|| {
                AppError::ConfigError("process isolation needs a worker command".into())
            })?;
            Ok(Arc::new(ProcessSpawner::new(ctx.clone(), command)))
        }
    }
}
