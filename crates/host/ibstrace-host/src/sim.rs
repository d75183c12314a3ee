//! A simulated IBS op-sampling unit.
//!
//! Stands in for the register bank, the notification line, and the entry
//! glue at once, so the full upload, trigger, and drain cycle runs on any
//! host. The uploaded bytes are treated as an op stream rather than
//! executed:
//!
//! - every byte is one op, retired at `code_base + index`;
//! - `0xC3` (`ret`) ends a pass, and the stream is run `iterations` passes;
//! - while `IbsOpEn` is set each op advances `IbsOpCurCnt`; reaching the
//!   period latches `IbsOpVal` with the op's address and raises the
//!   notification synchronously, before the next op retires.
//!
//! The glue returns the number of ops retired and writes the same count into
//! the first word of the scratch page.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ibstrace_core::msr::{self, IbsOpCtl, Msr, OpCtlFlags};
use ibstrace_core::platform::{
    EntryArgs, EntryGlue, NmiHandler, NmiStatus, NotifyLine, Platform, SamplingRegisters,
};
use ibstrace_core::{Config, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher::ThreadDispatcher;
use crate::memory::ProcessMemory;

/// Number of registers in the IBS op bank.
const BANK_LEN: usize = 9;

/// The opcode that ends a pass over the op stream.
pub const RET: u8 = 0xc3;

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Passes over the op stream per trigger.
    pub iterations: u64,
    /// Pin the stand-in target thread to `target_cpu`.
    pub pin: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { iterations: 0x1_0000, pin: false }
    }
}

/// Register file, notification line, and op-stream executor.
pub struct SimulatedUnit {
    regs: [AtomicU64; BANK_LEN],
    handler: Mutex<Option<Arc<dyn NmiHandler>>>,
    iterations: u64,
    retired: AtomicU64,
    overflows: AtomicU64,
    unhandled: AtomicU64,
}

impl SimulatedUnit {
    /// Creates a unit that runs the op stream `iterations` times per call.
    pub fn new(iterations: u64) -> Self {
        Self {
            regs: core::array::from_fn(|_| AtomicU64::new(0)),
            handler: Mutex::new(None),
            iterations,
            retired: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
        }
    }

    fn slot(msr: Msr) -> Option<usize> {
        let index = msr.addr().checked_sub(msr::IBS_OP_CTL.addr())?;
        let index = usize::try_from(index).ok()?;
        (index < BANK_LEN).then_some(index)
    }

    fn set(&self, msr: Msr, value: u64) {
        if let Some(i) = Self::slot(msr) {
            self.regs[i].store(value, Ordering::Relaxed);
        }
    }

    fn get(&self, msr: Msr) -> u64 {
        Self::slot(msr).map_or(0, |i| self.regs[i].load(Ordering::Relaxed))
    }

    /// Total ops retired across all calls.
    pub fn ops_retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Total overflows latched across all calls.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Overflows no handler claimed.
    pub fn unhandled(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    /// Raises the notification line once.
    pub fn raise(&self) -> NmiStatus {
        let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let status = handler.map_or(NmiStatus::NotHandled, |h| h.handle());
        if status == NmiStatus::NotHandled {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
        }
        status
    }

    /// Retires one op at `rip`.
    fn retire(&self, rip: u64, op: u8, tgt_rip: u64) {
        let ctl = IbsOpCtl(self.get(msr::IBS_OP_CTL));
        if !ctl.is_enabled() || ctl.is_valid() || ctl.period() == 0 {
            return;
        }

        let cur = ctl.cur_cnt() + 1;
        if cur < ctl.period() {
            self.set(msr::IBS_OP_CTL, ctl.with_cur_cnt(cur).0);
            return;
        }

        // Overflow: the counter restarts and this op is the tagged one.
        let latched = ctl.with_cur_cnt(0).0 | OpCtlFlags::VALID.bits();
        self.set(msr::IBS_OP_RIP, rip);
        self.set(msr::IBS_OP_DATA, u64::from(op));
        self.set(msr::IBS_OP_DATA2, 0);
        self.set(msr::IBS_OP_DATA3, 0);
        self.set(msr::IBS_DC_LIN_AD, 0);
        self.set(msr::IBS_DC_PHYS_AD, 0);
        self.set(msr::BP_IBSTGT_RIP, tgt_rip);
        self.set(msr::IBS_OP_CTL, latched);
        self.overflows.fetch_add(1, Ordering::Relaxed);
        self.raise();
    }

    /// Runs the op stream and returns the number of ops retired.
    pub fn execute(&self, code: &[u8], code_base: u64, offset: u64) -> u64 {
        let tgt_rip = code_base.wrapping_add(offset);
        let mut retired = 0u64;
        for _ in 0..self.iterations {
            for (i, &op) in code.iter().enumerate() {
                self.retire(code_base + i as u64, op, tgt_rip);
                retired += 1;
                if op == RET {
                    break;
                }
            }
        }
        self.retired.fetch_add(retired, Ordering::Relaxed);
        retired
    }
}

impl SamplingRegisters for SimulatedUnit {
    fn read(&self, msr: Msr) -> u64 {
        self.get(msr)
    }

    fn write(&self, msr: Msr, value: u64) {
        self.set(msr, value);
    }

    fn check_support(&self) -> Result<()> {
        Ok(())
    }
}

impl NotifyLine for SimulatedUnit {
    fn attach(&self, handler: Arc<dyn NmiHandler>) -> Result<()> {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    fn detach(&self) {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl EntryGlue for SimulatedUnit {
    unsafe fn call(&self, code: &[u8], args: EntryArgs) -> u64 {
        let retired = self.execute(code, code.as_ptr() as u64, args.offset);
        if args.scratch != 0 {
            // SAFETY: the caller passes the scratch page, which is at least
            // one aligned word long.
            unsafe { (args.scratch as *mut u64).write_volatile(retired) };
        }
        retired
    }
}

impl core::fmt::Debug for SimulatedUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedUnit")
            .field("iterations", &self.iterations)
            .field("retired", &self.ops_retired())
            .field("overflows", &self.overflows())
            .finish_non_exhaustive()
    }
}

/// Builds a platform around a fresh [`SimulatedUnit`].
///
/// The unit is returned alongside so callers can inspect its counters.
pub fn simulated_platform(
    config: &Config,
    sim: &SimConfig,
) -> Result<(Platform, Arc<SimulatedUnit>)> {
    let unit = Arc::new(SimulatedUnit::new(sim.iterations));
    let platform = Platform {
        registers: unit.clone(),
        line: unit.clone(),
        dispatcher: Arc::new(ThreadDispatcher::spawn(config.target_cpu, sim.pin)?),
        glue: unit.clone(),
        memory: Arc::new(ProcessMemory::new()?),
    };
    Ok((platform, unit))
}
