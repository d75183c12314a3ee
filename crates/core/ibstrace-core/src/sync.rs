//! One-shot rendezvous between the controller and the target unit.
//!
//! A [`Completion`] is resolved exactly once by the remote task and waited
//! on by the controller. It stands in for a lock that is acquired on one
//! unit and released on another.

use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A value that becomes available exactly once.
#[derive(Debug)]
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates an unresolved completion.
    pub fn new() -> Self {
        Self { slot: Mutex::new(Slot::Pending), cond: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // The slot is a plain state machine; a panicking holder cannot leave
        // it half-updated.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the completion and wakes the waiter.
    ///
    /// Only the first call has any effect.
    pub fn signal(&self, value: T) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(value);
            self.cond.notify_all();
        }
    }

    /// Returns `true` once [`signal`](Self::signal) has been called.
    pub fn is_signaled(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }

    /// Takes the value if it is ready, without blocking.
    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.lock();
        match core::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Blocks until the completion is resolved and takes the value.
    ///
    /// Returns `None` if the value was already taken.
    pub fn wait(&self) -> Option<T> {
        let mut slot = self.lock();
        while matches!(*slot, Slot::Pending) {
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        match core::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `Err(())` if the completion is still pending when the timeout
    /// expires; the value can then be collected later with
    /// [`try_take`](Self::try_take) or [`wait`](Self::wait).
    #[allow(clippy::result_unit_err)]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, ()> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        while matches!(*slot, Slot::Pending) {
            let now = Instant::now();
            if now >= deadline {
                return Err(());
            }
            slot = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match core::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }
}
