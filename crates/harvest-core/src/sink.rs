use std::sync::{Mutex, MutexGuard};

use crate::task::{DeadLetter, TaskResult};

/// Thread-safe append-only log.
///
/// Every `append` is stored as exactly one entry, in call order.
/// `snapshot` copies the entries out so callers never iterate under the lock.
#[derive(Debug)]
pub struct AppendLog<T> {
    entries: Mutex<Vec<T>>,
}

/// Outputs of successfully completed tasks.
pub type ResultSink = AppendLog<TaskResult>;

/// Tasks that will not be attempted again.
pub type DeadLetters = AppendLog<DeadLetter>;

impl<T> Default for AppendLog<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> AppendLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<T>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned sink mutex");
            poisoned.into_inner()
        })
    }

    pub fn append(&self, entry: T) {
        self.lock_entries().push(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock_entries().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
