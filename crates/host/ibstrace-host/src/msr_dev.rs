//! Raw MSR access through the Linux `msr` driver.
//!
//! Used only by the `ibst msr` inspection command. It is not a
//! [`SamplingRegisters`](ibstrace_core::platform::SamplingRegisters)
//! implementation: every access is a fallible system call, which the
//! collector can never afford.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use ibstrace_core::msr::{IBS_MSRS, Msr};
use ibstrace_core::{Error, Result};

/// An open `/dev/cpu/N/msr` device.
#[derive(Debug)]
pub struct DevMsr {
    cpu: u32,
    file: File,
}

impl DevMsr {
    /// Device path for `cpu`.
    pub fn path(cpu: u32) -> PathBuf {
        PathBuf::from(format!("/dev/cpu/{cpu}/msr"))
    }

    /// Opens the device for `cpu` read-only.
    pub fn open(cpu: u32) -> Result<Self> {
        let file = File::open(Self::path(cpu)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::TargetOffline(cpu),
            _ => Error::platform("open msr device", e),
        })?;
        Ok(Self { cpu, file })
    }

    /// CPU this device reads.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Reads `msr`.
    pub fn read(&self, msr: Msr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, u64::from(msr.addr()))
            .map_err(|e| Error::platform("read msr", e))?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads the whole IBS op bank. Unreadable registers are reported
    /// individually.
    pub fn read_ibs_bank(&self) -> Vec<(Msr, &'static str, Result<u64>)> {
        IBS_MSRS.iter().map(|&(msr, name)| (msr, name, self.read(msr))).collect()
    }
}
