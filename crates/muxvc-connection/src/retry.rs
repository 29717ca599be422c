//! Try-lock and deferred retry helpers
//!
//! Code that needs a second lock never waits for it. It takes the lock with
//! [`try_acquire`] and, on a miss, reschedules itself with [`schedule`]
//! after the configured retry delay.

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Take `mutex` if it is free, recovering from poisoning
pub(crate) fn try_acquire<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Take `mutex`, waiting if needed
///
/// Only for callers that hold no other lock.
pub(crate) fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `task` on the runtime after `delay`
pub(crate) fn schedule<F>(runtime: &Handle, delay: Duration, task: F) -> AbortHandle
where
    F: FnOnce() + Send + 'static,
{
    runtime
        .spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        })
        .abort_handle()
}

/// A cancellable deferred task that can be re-armed
///
/// Arming replaces (and aborts) whatever was armed before.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    handle: Option<AbortHandle>,
}

impl TimerSlot {
    pub fn arm(&mut self, handle: AbortHandle) {
        if let Some(old) = self.handle.replace(handle) {
            old.abort();
        }
    }

    /// Abort the armed task, returning whether one was pending
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
