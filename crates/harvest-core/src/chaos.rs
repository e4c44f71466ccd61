//! Fault injection for exercising crash recovery.
//!
//! Wraps any [`Operation`] and makes a configurable share of its invocations
//! fail before the inner operation runs. Pointed at a real crawl, it turns a
//! clean run into one where workers crash and get replaced.
//!
//! ```rust
//! use async_trait::async_trait;
//! use harvest_core::chaos::FaultInjector;
//! use harvest_core::{AppError, Operation, Params, TaskContext};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Operation for Echo {
//!     async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
//!         ctx.record(params)
//!     }
//! }
//!
//! let flaky = FaultInjector::new(Echo, 0.25);
//! assert_eq!(flaky.rate(), 0.25);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::AppError;
use crate::operation::{Operation, TaskContext};
use crate::task::Params;

/// An [`Operation`] wrapper that fails with probability `rate`.
pub struct FaultInjector<O> {
    inner: O,
    rate: f64,
    state: AtomicU64,
}

impl<O: Operation> FaultInjector<O> {
    /// `rate` is clamped to `[0, 1]`.
    pub fn new(inner: O, rate: f64) -> Self {
        Self::with_seed(inner, rate, clock_seed())
    }

    /// Same as [`new`](Self::new) with a fixed seed, for reproducible runs.
    pub fn with_seed(inner: O, rate: f64, seed: u64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self {
            inner,
            rate,
            // xorshift never leaves zero
            state: AtomicU64::new(seed.max(1)),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn should_fail(&self) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        if self.rate >= 1.0 {
            return true;
        }
        let roll = self.next_random() as f64 / u64::MAX as f64;
        roll < self.rate
    }

    fn next_random(&self) -> u64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let next = xorshift64(current);
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[async_trait]
impl<O: Operation> Operation for FaultInjector<O> {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        if self.should_fail() {
            tracing::debug!(task_id = %ctx.task_id(), operation = %ctx.operation(), "Injecting fault");
            return Err(AppError::OperationFailed {
                operation: ctx.operation().clone(),
                message: "injected fault".to_string(),
            });
        }
        self.inner.run(ctx, params).await
    }
}

// ---------------------------------------------------------------------------
// std-only randomness, seeded from the clock. Not for anything but chaos.
// ---------------------------------------------------------------------------

fn clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}
