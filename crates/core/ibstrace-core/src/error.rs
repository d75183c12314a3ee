//! Error type shared by every coordinator operation.
//!
//! Failures never cross the controller/target-unit boundary: each one is
//! returned to the immediate caller, and the command protocol turns it into
//! a negative errno status with [`Error::errno`].

use core::fmt;
use std::io;

/// `EFAULT`: a caller buffer could not be fully read or written.
pub const EFAULT: i64 = 14;
/// `EBUSY`: a previously timed-out payload is still running.
pub const EBUSY: i64 = 16;
/// `ENODEV`: the target unit is offline.
pub const ENODEV: i64 = 19;
/// `EINVAL`: invalid argument, malformed payload or unknown command.
pub const EINVAL: i64 = 22;
/// `ETIMEDOUT`: the bounded rendezvous wait expired.
pub const ETIMEDOUT: i64 = 110;

/// Errors reported by the coordinator and its platform services.
#[derive(Debug)]
pub enum Error {
    /// Upload with a zero-length payload.
    EmptyUpload,
    /// Upload larger than the code buffer.
    UploadTooLarge {
        /// Requested length in bytes.
        len: usize,
        /// Code buffer capacity in bytes.
        capacity: usize,
    },
    /// Trigger requested while the code buffer holds no committed program.
    NoCode,
    /// Precise-mode offset above [`crate::protocol::MAX_OFFSET`].
    OffsetTooLarge {
        /// Requested offset.
        offset: u64,
        /// Largest accepted offset.
        max: u64,
    },
    /// Command code not understood by the protocol layer.
    UnknownCommand(u32),
    /// Request payload has the wrong shape.
    MalformedRequest {
        /// Expected payload length in bytes.
        expected: usize,
        /// Actual payload length in bytes.
        actual: usize,
    },
    /// A caller-provided buffer faulted during a copy.
    Fault,
    /// A payload from an earlier, timed-out trigger is still running.
    Busy,
    /// The target unit did not signal completion in time.
    Timeout,
    /// The target unit cannot accept work.
    TargetOffline(u32),
    /// The sampling facility is absent or the vendor does not match.
    Unsupported(&'static str),
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
    /// An OS or hardware service failed.
    Platform {
        /// What was being attempted.
        context: &'static str,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The coordinator lock was poisoned by a panicking holder.
    Poisoned,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Wraps an I/O error from a platform service.
    pub fn platform(context: &'static str, source: io::Error) -> Self {
        Self::Platform { context, source }
    }

    /// Returns the positive errno value for this error.
    ///
    /// The command protocol reports `-errno()` to the controller.
    pub fn errno(&self) -> i64 {
        match self {
            Self::EmptyUpload
            | Self::UploadTooLarge { .. }
            | Self::NoCode
            | Self::OffsetTooLarge { .. }
            | Self::UnknownCommand(_)
            | Self::MalformedRequest { .. }
            | Self::InvalidConfig(_) => EINVAL,
            Self::Fault => EFAULT,
            Self::Busy | Self::Poisoned => EBUSY,
            Self::Timeout => ETIMEDOUT,
            Self::TargetOffline(_) | Self::Unsupported(_) => ENODEV,
            Self::Platform { source, .. } => source.raw_os_error().map_or(EINVAL, i64::from),
        }
    }

    /// Returns `true` for the invalid-argument class of errors.
    pub fn is_invalid_argument(&self) -> bool {
        self.errno() == EINVAL && !matches!(self, Self::Platform { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyUpload => write!(f, "upload payload is empty"),
            Self::UploadTooLarge { len, capacity } => {
                write!(f, "upload of {len} bytes exceeds code buffer capacity of {capacity} bytes")
            }
            Self::NoCode => write!(f, "no code has been uploaded"),
            Self::OffsetTooLarge { offset, max } => {
                write!(f, "precise offset {offset:#x} exceeds maximum {max:#x}")
            }
            Self::UnknownCommand(cmd) => write!(f, "unsupported command code {cmd:#x}"),
            Self::MalformedRequest { expected, actual } => {
                write!(f, "malformed request: expected {expected} bytes, got {actual}")
            }
            Self::Fault => write!(f, "caller buffer faulted during copy"),
            Self::Busy => write!(f, "target unit is still running a previous payload"),
            Self::Timeout => write!(f, "target unit did not signal completion in time"),
            Self::TargetOffline(cpu) => write!(f, "target unit cpu #{cpu} is offline"),
            Self::Unsupported(why) => write!(f, "sampling facility unsupported: {why}"),
            Self::InvalidConfig(why) => write!(f, "invalid configuration: {why}"),
            Self::Platform { context, source } => write!(f, "{context}: {source}"),
            Self::Poisoned => write!(f, "coordinator lock poisoned"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform { source, .. } => Some(source),
            _ => None,
        }
    }
}
