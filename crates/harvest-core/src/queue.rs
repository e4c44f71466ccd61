//! Shared FIFO of pending tasks.
//!
//! Besides the pending tasks the queue counts tasks that were handed out by
//! [`TaskQueue::pop`] but not yet settled. A task in progress may still fan
//! out, so "empty" alone does not mean the run is over; [`TaskQueue::is_drained`]
//! is true only when nothing is pending *and* nothing is in progress.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    in_progress: usize,
}

impl QueueState {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_progress == 0
    }
}

/// Unbounded, thread-safe task queue shared by the supervisor and all workers.
///
/// Works from any tokio runtime: each thread worker runs its own runtime and
/// they all wait on the same [`Notify`].
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl TaskQueue {
    /// Create an empty queue. `pop` returns early once `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel,
        }
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned task queue mutex");
            poisoned.into_inner()
        })
    }

    /// Insert at the tail. Never blocks, never fails.
    pub fn put(&self, task: Task) {
        self.lock_state().pending.push_back(task);
        self.notify.notify_one();
    }

    pub fn extend(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.put(task);
        }
    }

    /// Restore a task whose worker died before completing it.
    ///
    /// `task` must be one handed out by [`pop`](Self::pop): it goes back to
    /// the tail and stops counting as in progress, under one lock, so the
    /// queue never looks drained in between.
    pub fn requeue(&self, task: Task) {
        tracing::debug!(task_id = %task.id, attempt = task.attempt, "Requeueing task");
        self.complete(vec![task]);
    }

    fn try_pop(&self) -> Option<Task> {
        let mut state = self.lock_state();
        let task = state.pending.pop_front()?;
        state.in_progress += 1;
        Some(task)
    }

    /// Remove and return the head, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, on cancellation (even if tasks are still
    /// pending), or as soon as the queue is drained (no task will ever
    /// arrive). The returned task counts as in progress until it is settled
    /// with [`complete`](Self::complete),
    /// [`requeue`](Self::requeue) or
    /// [`task_done`](Self::task_done).
    pub async fn pop(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a put/task_done between
            // the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            if self.is_drained() {
                return None;
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return None,
                () = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Settle an in-progress task successfully, enqueueing its fan-out first.
    ///
    /// Both happen under one lock, so the queue never looks drained while
    /// the children are on their way in.
    pub fn complete(&self, spawned: Vec<Task>) {
        let (added, drained) = {
            let mut state = self.lock_state();
            let added = spawned.len();
            state.pending.extend(spawned);
            state.in_progress = state.in_progress.saturating_sub(1);
            (added, state.is_drained())
        };
        for _ in 0..added {
            self.notify.notify_one();
        }
        if drained {
            self.notify.notify_waiters();
        }
    }

    /// Settle an in-progress task without producing anything.
    pub fn task_done(&self) {
        self.complete(Vec::new());
    }

    /// Approximate number of pending tasks. A snapshot, not a guarantee.
    pub fn size(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Number of tasks handed out and not yet settled.
    pub fn in_progress(&self) -> usize {
        self.lock_state().in_progress
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when nothing is pending and nothing is in progress.
    pub fn is_drained(&self) -> bool {
        self.lock_state().is_drained()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Remove every pending task (used to report unfinished work on cancel).
    pub fn drain_pending(&self) -> Vec<Task> {
        self.lock_state().pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn task(n: u32) -> Task {
        Task::new("test.op").with_param("n", n)
    }

    fn n_of(task: &Task) -> u32 {
        task.params.get("n").unwrap()
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let queue = TaskQueue::new(CancellationToken::new());
        for n in 0..5 {
            queue.put(task(n));
        }
        let mut seen = Vec::new();
        while let Some(t) = queue.pop(Duration::from_millis(10)).await {
            seen.push(n_of(&t));
            queue.task_done();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn pop_on_empty_drained_queue_returns_immediately() {
        let queue = TaskQueue::new(CancellationToken::new());
        let start = Instant::now();
        assert!(queue.pop(Duration::from_secs(5)).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pop_times_out_while_work_is_in_progress() {
        let queue = TaskQueue::new(CancellationToken::new());
        queue.put(task(1));
        let _held = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert!(!queue.is_drained());

        let start = Instant::now();
        assert!(queue.pop(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn pop_wakes_on_fan_out_from_in_progress_task() {
        let queue = Arc::new(TaskQueue::new(CancellationToken::new()));
        queue.put(task(1));
        let _parent = queue.pop(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete(vec![task(2), task(3)]);

        let child = waiter.await.unwrap().expect("waiter should receive a child");
        assert_eq!(n_of(&child), 2);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.in_progress(), 1);
    }

    #[tokio::test]
    async fn waiters_wake_when_queue_becomes_drained() {
        let queue = Arc::new(TaskQueue::new(CancellationToken::new()));
        queue.put(task(1));
        let _held = queue.pop(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let start = Instant::now();
                let popped = queue.pop(Duration::from_secs(5)).await;
                (popped.is_none(), start.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.task_done();

        let (empty, waited) = waiter.await.unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(1));
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn requeue_keeps_content_but_loses_its_place() {
        let queue = TaskQueue::new(CancellationToken::new());
        queue.put(task(9));
        queue.put(task(10));
        let held = queue.pop(Duration::from_millis(10)).await.unwrap();
        queue.requeue(held.next_attempt());

        assert_eq!(queue.in_progress(), 0);
        assert_eq!(queue.size(), 2);
        assert!(!queue.is_drained());

        let first = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(n_of(&first), 10);
        let again = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(n_of(&again), 9);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pop() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(TaskQueue::new(cancel.clone()));
        queue.put(task(1));
        let _held = queue.pop(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let start = Instant::now();
                let popped = queue.pop(Duration::from_secs(10)).await;
                (popped.is_none(), start.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let (empty, waited) = waiter.await.unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancelled_queue_stops_handing_out_tasks() {
        let cancel = CancellationToken::new();
        let queue = TaskQueue::new(cancel.clone());
        queue.put(task(1));
        cancel.cancel();
        assert!(queue.pop(Duration::from_secs(1)).await.is_none());
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(TaskQueue::new(CancellationToken::new()));
        let handles: Vec<_> = (0..8)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for n in 0..250 {
                        queue.put(task(p * 1000 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.size(), 2000);
        assert_eq!(queue.drain_pending().len(), 2000);
        assert!(queue.is_drained());
    }
}
