//! Debouncing guard for asynchronous operations.
//!
//! An [`AsyncLock`] lets at most one invocation of an operation run at a time.
//! It is not a queue: a call that arrives while another is in flight is
//! dropped and returns immediately, trusting the in-flight call to settle the
//! state. This collapses rapid double triggers (a click and a touch event for
//! the same action, a focus and a pageshow signal) into one effective call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

/// Per-operation re-entrancy guard.
#[derive(Debug)]
pub struct AsyncLock {
    name: &'static str,
    locked: AtomicBool,
}

impl AsyncLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    /// Name of the guarded operation, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Run `body` unless another invocation is in flight.
    ///
    /// Returns `None` without calling `body` when the lock is held. The flag
    /// is cleared when the body settles, including when the returned future
    /// is dropped before completion.
    pub async fn invoke<F, Fut, T>(&self, body: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.try_acquire() else {
            debug!(target: "accent::lock", "{}: already running, call dropped", self.name);
            return None;
        };
        Some(body().await)
    }

    fn try_acquire(&self) -> Option<LockGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard { lock: self })
    }
}

struct LockGuard<'a> {
    lock: &'a AsyncLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
