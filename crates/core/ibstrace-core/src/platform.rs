//! Capabilities the coordinator consumes from its environment.
//!
//! The core never resolves symbols, touches page tables, or installs
//! interrupt handlers itself. A [`Platform`] bundle is constructed once by
//! the host and handed to [`Coordinator::new`](crate::Coordinator::new).

use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::msr::Msr;

/// Access to the IBS MSR bank of the target unit.
///
/// Reads and writes are issued from the target unit itself, either on the
/// trampoline path or from the collector in interrupt context, and must not
/// block or allocate.
pub trait SamplingRegisters: Send + Sync {
    /// Reads the 64-bit value of `msr`.
    fn read(&self, msr: Msr) -> u64;

    /// Writes `value` to `msr`.
    fn write(&self, msr: Msr, value: u64);

    /// Checks that the sampling facility is present and usable.
    ///
    /// Called exactly once, at coordinator start. An error here is fatal.
    fn check_support(&self) -> Result<()>;
}

/// Outcome of one invocation of a notification handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmiStatus {
    /// The notification came from the sampling hardware and was consumed.
    Handled,
    /// The notification was not ours; other handlers should inspect it.
    NotHandled,
}

/// A handler bound to the sampling hardware's notification line.
pub trait NmiHandler: Send + Sync {
    /// Services one notification. Must complete in bounded time.
    fn handle(&self) -> NmiStatus;
}

/// The notification line raised by the sampling hardware on overflow.
pub trait NotifyLine: Send + Sync {
    /// Binds `handler` to the line, ahead of any other handler.
    fn attach(&self, handler: Arc<dyn NmiHandler>) -> Result<()>;

    /// Unbinds the handler installed by [`attach`](Self::attach).
    fn detach(&self);
}

/// Arguments passed to uploaded code, in SysV order (rdi, rsi, rdx).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryArgs {
    /// Virtual address of the scratch page.
    pub scratch: u64,
    /// Caller-supplied pointer argument (precise mode only).
    pub arg: u64,
    /// Caller-supplied target offset (precise mode only).
    pub offset: u64,
}

/// The raw call sequence that transfers control into the code buffer.
pub trait EntryGlue: Send + Sync {
    /// Calls `code` as a function and returns its return-value register.
    ///
    /// # Safety
    ///
    /// `code` must be the committed contents of an executable code buffer,
    /// and the caller must be running on the target unit.
    unsafe fn call(&self, code: &[u8], args: EntryArgs) -> u64;
}

/// Page permission and address translation services.
pub trait MemoryServices: Send + Sync {
    /// Marks `pages` pages starting at `addr` executable.
    ///
    /// # Safety
    ///
    /// The range must be a page-aligned allocation owned by the caller.
    unsafe fn set_executable(&self, addr: usize, pages: usize) -> Result<()>;

    /// Revokes execute permission on `pages` pages starting at `addr`.
    ///
    /// # Safety
    ///
    /// Same contract as [`set_executable`](Self::set_executable).
    unsafe fn set_non_executable(&self, addr: usize, pages: usize) -> Result<()>;

    /// Resolves the physical address backing `addr`, if the host can.
    fn physical_address(&self, addr: usize) -> Option<u64> {
        let _ = addr;
        None
    }
}

/// Everything the coordinator needs from its environment.
#[derive(Clone)]
pub struct Platform {
    /// IBS register bank of the target unit.
    pub registers: Arc<dyn SamplingRegisters>,
    /// Notification line the collector is bound to.
    pub line: Arc<dyn NotifyLine>,
    /// Cross-core work submission to the target unit.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Call sequence into uploaded code.
    pub glue: Arc<dyn EntryGlue>,
    /// Page permission services for the code buffer.
    pub memory: Arc<dyn MemoryServices>,
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("target", &self.dispatcher.target())
            .finish_non_exhaustive()
    }
}

/// Register bank for environments without a sampling facility.
///
/// Reads return zero, writes are discarded, and [`check_support`](SamplingRegisters::check_support)
/// always fails. Only usable with `Config::sampling = false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegisters;

impl SamplingRegisters for NullRegisters {
    fn read(&self, _msr: Msr) -> u64 {
        0
    }

    fn write(&self, _msr: Msr, _value: u64) {}

    fn check_support(&self) -> Result<()> {
        Err(Error::Unsupported("no sampling facility on this platform"))
    }
}

/// A notification line that never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLine;

impl NotifyLine for NullLine {
    fn attach(&self, _handler: Arc<dyn NmiHandler>) -> Result<()> {
        Ok(())
    }

    fn detach(&self) {}
}
