//! Cross-core work submission.
//!
//! A [`Dispatcher`] runs a task on the target unit and returns immediately.
//! [`call_on_target`] layers the controller's blocking handshake on top of
//! that: the remote task resolves a [`Completion`] when it finishes, and the
//! caller waits on it, optionally with a bound.

use core::time::Duration;
use std::sync::Arc;

use crate::error::Result;
use crate::sync::Completion;

/// A unit of work for the target unit.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fire-and-continue submission of work to one processing unit.
pub trait Dispatcher: Send + Sync {
    /// Logical CPU number of the target unit.
    fn target(&self) -> u32;

    /// Queues `task` for execution on the target unit.
    ///
    /// Returns as soon as the task is queued. Fails with
    /// [`Error::TargetOffline`](crate::Error::TargetOffline) if the unit
    /// cannot accept work.
    fn dispatch(&self, task: Task) -> Result<()>;
}

/// Result of a blocking call into the target unit.
#[derive(Debug)]
pub enum Rendezvous<T> {
    /// The remote task finished and produced a value.
    Done(T),
    /// The bounded wait expired. The task is still running and will resolve
    /// the returned completion when it finishes.
    TimedOut(Arc<Completion<T>>),
}

/// Runs `f` on the target unit and waits for its result.
///
/// With `timeout == None` this blocks until the remote task signals, the way
/// the handshake has always behaved.
pub fn call_on_target<T, F>(
    dispatcher: &dyn Dispatcher,
    timeout: Option<Duration>,
    f: F,
) -> Result<Rendezvous<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let done = Arc::new(Completion::new());
    let remote = Arc::clone(&done);
    dispatcher.dispatch(Box::new(move || remote.signal(f())))?;

    let value = match timeout {
        None => done.wait(),
        Some(timeout) => match done.wait_timeout(timeout) {
            Ok(value) => value,
            Err(()) => return Ok(Rendezvous::TimedOut(done)),
        },
    };
    // The completion is private to this call, so the value cannot have been
    // taken by anyone else.
    match value {
        Some(value) => Ok(Rendezvous::Done(value)),
        None => Ok(Rendezvous::TimedOut(done)),
    }
}
