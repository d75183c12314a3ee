//! Hosted platform services for `ibstrace-core`.
//!
//! Two platforms are assembled here:
//!
//! - [`simulated_platform`]: a [`sim::SimulatedUnit`] provides the sampling
//!   registers, the notification line, and the entry glue. Runs anywhere.
//! - [`native_platform`]: uploaded code really executes on a worker thread
//!   pinned to the target CPU, through the x86_64 call glue. User space
//!   cannot program IBS or take its NMIs, so this platform only supports
//!   `Config::sampling = false`.

pub mod dispatcher;
pub mod memory;
pub mod msr_dev;
pub mod sim;

use std::sync::Arc;

use ibstrace_core::platform::{NullLine, NullRegisters, Platform};
use ibstrace_core::{Config, Error, Result};

pub use dispatcher::ThreadDispatcher;
pub use memory::ProcessMemory;
pub use msr_dev::DevMsr;
pub use sim::{SimConfig, SimulatedUnit, simulated_platform};

/// Builds a platform that executes uploaded code natively.
pub fn native_platform(config: &Config) -> Result<Platform> {
    let glue = ibstrace_core::arch::native_entry()
        .ok_or(Error::Unsupported("no native entry glue for this architecture"))?;
    Ok(Platform {
        registers: Arc::new(NullRegisters),
        line: Arc::new(NullLine),
        dispatcher: Arc::new(ThreadDispatcher::spawn(config.target_cpu, true)?),
        glue,
        memory: Arc::new(ProcessMemory::new()?),
    })
}
