//! The numeric command surface.
//!
//! Every request returns a signed status: a non-negative count or zero on
//! success, a negative errno on failure. Payloads cross the boundary through
//! [`UserSource`] and [`UserSink`], which model a caller buffer that may
//! fault part-way through a copy.

use crate::coordinator::{Coordinator, TriggerMode};
use crate::error::{Error, Result};

/// Largest target offset accepted by [`Command::Precise`].
pub const MAX_OFFSET: u64 = 0x40_0000;

/// A request code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Replace the code buffer with the payload.
    Write = 0x0000_1000,
    /// Trigger in plain mode.
    Measure = 0x0000_2000,
    /// Number of collected records.
    Samples = 0x0000_4000,
    /// Sample buffer capacity in records.
    Capacity = 0x0000_8000,
    /// Trigger in precise mode; payload is a [`PreciseArgs`].
    Precise = 0x0002_0000,
}

impl Command {
    /// The wire code.
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        Ok(match code {
            0x0000_1000 => Self::Write,
            0x0000_2000 => Self::Measure,
            0x0000_4000 => Self::Samples,
            0x0000_8000 => Self::Capacity,
            0x0002_0000 => Self::Precise,
            other => return Err(Error::UnknownCommand(other)),
        })
    }
}

/// Payload of [`Command::Precise`]: two little-endian words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreciseArgs {
    /// Opaque pointer argument forwarded to the program.
    pub arg: u64,
    /// Target offset into the code buffer.
    pub offset: u64,
}

impl PreciseArgs {
    /// Encoded size.
    pub const SIZE: usize = 16;

    /// Encodes the payload.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.arg.to_le_bytes());
        out[8..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decodes the payload from `src`.
    pub fn read_from(src: &dyn UserSource) -> Result<Self> {
        if src.len() != Self::SIZE {
            return Err(Error::MalformedRequest { expected: Self::SIZE, actual: src.len() });
        }
        let mut buf = [0u8; Self::SIZE];
        src.copy_to(&mut buf)?;
        let (arg, offset) = buf.split_at(8);
        let word = |b: &[u8]| {
            let mut w = [0u8; 8];
            w.copy_from_slice(b);
            u64::from_le_bytes(w)
        };
        Ok(Self { arg: word(arg), offset: word(offset) })
    }
}

/// A caller-owned buffer the coordinator copies from.
pub trait UserSource {
    /// Number of bytes available.
    fn len(&self) -> usize;

    /// Returns `true` if the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the first `dst.len()` bytes into `dst`.
    ///
    /// Fails with [`Error::Fault`] if the source cannot be read; `dst` may
    /// then be partially written.
    fn copy_to(&self, dst: &mut [u8]) -> Result<()>;
}

/// A caller-owned buffer the coordinator copies into.
pub trait UserSink {
    /// Appends `src` to the sink.
    ///
    /// Fails with [`Error::Fault`] if the sink cannot be written.
    fn copy_from(&mut self, src: &[u8]) -> Result<()>;
}

impl UserSource for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        let src = self.get(..dst.len()).ok_or(Error::Fault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl UserSource for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        self.as_slice().copy_to(dst)
    }
}

impl<const N: usize> UserSource for [u8; N] {
    fn len(&self) -> usize {
        N
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        self.as_slice().copy_to(dst)
    }
}

/// The empty payload, for commands that take no argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPayload;

impl UserSource for NoPayload {
    fn len(&self) -> usize {
        0
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() { Ok(()) } else { Err(Error::Fault) }
    }
}

impl UserSink for Vec<u8> {
    fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        self.extend_from_slice(src);
        Ok(())
    }
}

/// A fixed-size caller buffer, filled front to back. A copy that does not
/// fit faults.
impl UserSink for &mut [u8] {
    fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.len() {
            return Err(Error::Fault);
        }
        let (dst, rest) = core::mem::take(self).split_at_mut(src.len());
        dst.copy_from_slice(src);
        *self = rest;
        Ok(())
    }
}

fn status(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl Coordinator {
    /// Handles one request and returns its status.
    pub fn ioctl(&self, cmd: u32, payload: &dyn UserSource) -> i64 {
        match self.handle_command(cmd, payload) {
            Ok(status) => status,
            Err(e) => {
                log::debug!("ibstrace: command {cmd:#x} failed: {e}");
                -e.errno()
            }
        }
    }

    fn handle_command(&self, cmd: u32, payload: &dyn UserSource) -> Result<i64> {
        match Command::try_from(cmd)? {
            Command::Write => self.upload_from(payload).map(|_| 0),
            Command::Measure => self.trigger(TriggerMode::Measure).map(|_| 0),
            Command::Precise => {
                let PreciseArgs { arg, offset } = PreciseArgs::read_from(payload)?;
                self.trigger(TriggerMode::Precise { arg, offset }).map(|_| 0)
            }
            Command::Samples => self.sample_count().map(status),
            Command::Capacity => self.capacity().map(status),
        }
    }

    /// Drains up to `count` bytes of records into `sink`.
    ///
    /// Returns the number of bytes written, zero if nothing was collected or
    /// `count` is zero. On a copy fault the buffer is left intact.
    pub fn read(&self, sink: &mut dyn UserSink, count: usize) -> i64 {
        match self.drain_into(sink, count) {
            Ok(n) => status(n),
            Err(e) => {
                log::debug!("ibstrace: read of {count} bytes failed: {e}");
                -e.errno()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for cmd in [
            Command::Write,
            Command::Measure,
            Command::Samples,
            Command::Capacity,
            Command::Precise,
        ] {
            assert_eq!(Command::try_from(cmd.code()).unwrap(), cmd);
        }
        assert!(matches!(Command::try_from(0x1234), Err(Error::UnknownCommand(0x1234))));
    }

    #[test]
    fn precise_args_decode_little_endian() {
        let bytes = PreciseArgs { arg: 0xdead_beef, offset: 0x40 }.to_bytes();
        assert_eq!(&bytes[..4], &[0xef, 0xbe, 0xad, 0xde]);
        let args = PreciseArgs::read_from(&bytes).unwrap();
        assert_eq!(args, PreciseArgs { arg: 0xdead_beef, offset: 0x40 });
    }

    #[test]
    fn precise_args_reject_wrong_size() {
        let err = PreciseArgs::read_from(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest { expected: 16, actual: 8 }));
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn fixed_sink_faults_on_overflow() {
        let mut buf = [0u8; 4];
        let mut sink: &mut [u8] = &mut buf;
        assert!(sink.copy_from(&[1, 2]).is_ok());
        assert!(matches!(sink.copy_from(&[0; 5]), Err(Error::Fault)));
        assert_eq!(buf, [1, 2, 0, 0]);
    }
}
