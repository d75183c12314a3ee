//! The task that runs on the target unit for every trigger.

use std::sync::Arc;

use crate::msr;
use crate::platform::{EntryArgs, EntryGlue, SamplingRegisters};

/// Arms sampling, calls into the code buffer, and disarms.
#[derive(Clone)]
pub struct Trampoline {
    registers: Arc<dyn SamplingRegisters>,
    glue: Arc<dyn EntryGlue>,
    sampling: bool,
    period: u32,
}

impl Trampoline {
    /// Creates a trampoline.
    ///
    /// With `sampling == false` the register bank is never touched.
    pub fn new(
        registers: Arc<dyn SamplingRegisters>,
        glue: Arc<dyn EntryGlue>,
        sampling: bool,
        period: u32,
    ) -> Self {
        Self { registers, glue, sampling, period }
    }

    /// Runs `code` once with `args` and returns its return-value register.
    ///
    /// # Safety
    ///
    /// Must be called on the target unit, and `code` must be the committed
    /// contents of an executable code buffer.
    pub unsafe fn run(&self, code: &[u8], args: EntryArgs) -> u64 {
        if self.sampling {
            msr::arm(&*self.registers, self.period);
        }
        // SAFETY: forwarded from the caller.
        let ret = unsafe { self.glue.call(code, args) };
        if self.sampling {
            msr::disarm(&*self.registers);
        }
        ret
    }
}

impl core::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trampoline")
            .field("sampling", &self.sampling)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::{IBS_OP_CTL, IbsOpCtl};
    use crate::testutil::{FakeRegisters, FnGlue};

    #[test]
    fn code_runs_between_arm_and_disarm() {
        let regs = Arc::new(FakeRegisters::default());
        let observed = regs.clone();
        let glue = FnGlue::new(move |code: &[u8], args: EntryArgs| {
            let ctl = IbsOpCtl(observed.read(IBS_OP_CTL));
            assert!(ctl.is_enabled());
            assert_eq!(ctl.period(), 0x1000);
            assert_eq!(args.scratch, 0x5000);
            code.len() as u64
        });
        let trampoline = Trampoline::new(regs.clone(), Arc::new(glue), true, 0x1000);

        let args = EntryArgs { scratch: 0x5000, ..EntryArgs::default() };
        // SAFETY: the fake glue never executes `code`.
        let ret = unsafe { trampoline.run(&[0xc3; 3], args) };
        assert_eq!(ret, 3);
        assert_eq!(regs.read(IBS_OP_CTL), 0);
    }

    #[test]
    fn sampling_disabled_leaves_registers_alone() {
        let regs = Arc::new(FakeRegisters::default());
        let glue = FnGlue::new(|_: &[u8], _: EntryArgs| 42);
        let trampoline = Trampoline::new(regs.clone(), Arc::new(glue), false, 0x1000);
        // SAFETY: the fake glue never executes `code`.
        assert_eq!(unsafe { trampoline.run(&[0xc3], EntryArgs::default()) }, 42);
        assert!(regs.writes().is_empty());
    }
}
