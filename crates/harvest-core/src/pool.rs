use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::task::Task;
use crate::worker::{WorkerSlot, WorkerState};

/// A running worker: an OS thread or a child process.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// True until the underlying thread/process has terminated.
    fn is_alive(&self) -> bool;

    /// Wait for the unit to terminate. Unbounded; final shutdown only.
    async fn join(&mut self);
}

/// Starts execution units for one isolation model.
pub trait Spawner: Send + Sync {
    fn spawn(&self, slot: WorkerSlot) -> Result<Box<dyn ExecutionUnit>, AppError>;
}

/// A crashed unit, as seen once by whoever reaps it.
#[derive(Debug, Clone)]
pub struct Crash {
    pub worker_id: usize,
    /// The task the unit was holding, if any. Not yet settled in the queue.
    pub task: Option<Task>,
    pub failure: Option<String>,
}

/// Outcome of [`WorkerPool::replace`].
#[derive(Debug)]
pub enum Replacement {
    /// The current unit for this id is alive; nothing was spawned.
    AlreadyAlive,
    /// A new unit was started. Carries the old unit's crash if this call was
    /// the one that reaped it; its task still needs settling.
    Respawned(Option<Crash>),
}

/// Bookkeeping for one worker id.
pub struct WorkerRecord {
    pub id: usize,
    unit: Box<dyn ExecutionUnit>,
    slot: WorkerSlot,
    pub crash_count: u32,
    pub restarts: u32,
    reaped: bool,
}

impl WorkerRecord {
    fn is_alive(&self) -> bool {
        self.unit.is_alive()
    }

    /// Slot state, except that a dead unit that never reported an exit
    /// counts as crashed.
    fn state(&self) -> WorkerState {
        match self.slot.state() {
            WorkerState::Running if !self.is_alive() => WorkerState::Crashed,
            state => state,
        }
    }

    fn is_reapable(&self) -> bool {
        !self.reaped && !self.is_alive() && self.state() == WorkerState::Crashed
    }

    fn reap(&mut self) -> Option<Crash> {
        if !self.is_reapable() {
            return None;
        }
        self.reaped = true;
        self.crash_count += 1;
        let (task, failure) = self.slot.take_crash();
        Some(Crash {
            worker_id: self.id,
            task,
            failure,
        })
    }
}

/// Owns a fixed set of workers and (re)spawns them by id.
pub struct WorkerPool {
    spawner: Arc<dyn Spawner>,
    records: BTreeMap<usize, WorkerRecord>,
    restart_limit: Option<u32>,
    total_spawns: usize,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn Spawner>, restart_limit: Option<u32>) -> Self {
        Self {
            spawner,
            records: BTreeMap::new(),
            restart_limit,
            total_spawns: 0,
        }
    }

    /// Start a unit for `id` and store its record.
    pub fn spawn(&mut self, id: usize) -> Result<(), AppError> {
        let slot = WorkerSlot::new(id);
        let unit = self.spawner.spawn(slot.clone())?;
        self.total_spawns += 1;

        match self.records.get_mut(&id) {
            Some(record) => {
                record.unit = unit;
                record.slot = slot;
                record.reaped = false;
            }
            None => {
                self.records.insert(
                    id,
                    WorkerRecord {
                        id,
                        unit,
                        slot,
                        crash_count: 0,
                        restarts: 0,
                        reaped: false,
                    },
                );
            }
        }
        tracing::debug!(worker_id = id, spawns = self.total_spawns, "Spawned execution unit");
        Ok(())
    }

    pub fn is_alive(&self, id: usize) -> bool {
        self.records.get(&id).is_some_and(WorkerRecord::is_alive)
    }

    pub fn state(&self, id: usize) -> Option<WorkerState> {
        self.records.get(&id).map(WorkerRecord::state)
    }

    pub fn crash_count(&self, id: usize) -> u32 {
        self.records.get(&id).map_or(0, |r| r.crash_count)
    }

    pub fn crash_counts(&self) -> BTreeMap<usize, u32> {
        self.records
            .values()
            .map(|r| (r.id, r.crash_count))
            .collect()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.records.keys().copied().collect()
    }

    pub fn total_spawns(&self) -> usize {
        self.total_spawns
    }

    /// True while any unit is alive or still reports `Running`.
    ///
    /// A unit that reported `Crashed` but has not exited yet is still active:
    /// its task is only settled once it is gone.
    pub fn any_active(&self) -> bool {
        self.records
            .values()
            .any(|r| r.is_alive() || r.state() == WorkerState::Running)
    }

    /// Settle bookkeeping for a crashed, dead unit. Returns its crash once;
    /// later calls (and calls for healthy units) return `None`.
    pub fn reap(&mut self, id: usize) -> Option<Crash> {
        self.records.get_mut(&id).and_then(WorkerRecord::reap)
    }

    /// Ids whose units crashed and have not been reaped yet.
    pub fn reapable(&self) -> Vec<usize> {
        self.records
            .values()
            .filter(|r| r.is_reapable())
            .map(|r| r.id)
            .collect()
    }

    /// Ids whose units crashed and are gone (reaped or not).
    pub fn crashed(&self) -> Vec<usize> {
        self.records
            .values()
            .filter(|r| !r.is_alive() && r.state() == WorkerState::Crashed)
            .map(|r| r.id)
            .collect()
    }

    /// Respawn `id` if its unit is dead. Idempotent: when the current unit
    /// is alive (e.g. already replaced) nothing is spawned.
    pub fn replace(&mut self, id: usize) -> Result<Replacement, AppError> {
        let Some(record) = self.records.get_mut(&id) else {
            self.spawn(id)?;
            return Ok(Replacement::Respawned(None));
        };
        if record.is_alive() {
            return Ok(Replacement::AlreadyAlive);
        }

        let unsettled = record.reap();
        record.restarts += 1;
        if let Some(limit) = self.restart_limit
            && record.restarts > limit
        {
            return Err(AppError::RestartLimitExceeded {
                worker_id: id,
                restarts: record.restarts,
            });
        }

        self.spawn(id)?;
        Ok(Replacement::Respawned(unsettled))
    }

    /// Block until every unit has terminated.
    pub async fn join_all(&mut self) {
        for record in self.records.values_mut() {
            record.unit.join().await;
        }
    }
}
