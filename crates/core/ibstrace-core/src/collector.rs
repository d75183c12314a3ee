//! The overflow handler bound to the sampling hardware's notification line.
//!
//! Runs at non-maskable priority on the target unit, concurrently with the
//! uploaded program. It never blocks, allocates, logs, or touches the
//! coordinator lock; everything it shares with the rest of the system is
//! atomic.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::msr::{self, IbsOpCtl, Lfsr4, RestartRandomizer};
use crate::platform::{NmiHandler, NmiStatus, SamplingRegisters};
use crate::sample::Sample;
use crate::store::{Mode, ModeFlag, SampleBuffer};

/// Event counters kept by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Notifications that produced a record (or would have, had the buffer
    /// not been full).
    pub handled: u64,
    /// Notifications with `IbsOpVal` clear, passed on to other handlers.
    pub spurious: u64,
    /// Overflows with an empty MaxCnt field, acknowledged and discarded.
    pub degenerate: u64,
    /// Records discarded because the sample buffer was full.
    pub dropped: u64,
}

/// Collects one [`Sample`] per valid overflow.
pub struct Collector {
    registers: Arc<dyn SamplingRegisters>,
    samples: SampleBuffer,
    mode: ModeFlag,
    randomizer: RestartRandomizer,
    handled: AtomicU64,
    spurious: AtomicU64,
    degenerate: AtomicU64,
}

impl Collector {
    /// Creates a collector with a sample buffer of `capacity` records.
    pub fn new(registers: Arc<dyn SamplingRegisters>, capacity: usize, seed: Lfsr4) -> Self {
        Self {
            registers,
            samples: SampleBuffer::new(capacity),
            mode: ModeFlag::default(),
            randomizer: RestartRandomizer::new(seed),
            handled: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            degenerate: AtomicU64::new(0),
        }
    }

    /// The sample buffer this collector appends to.
    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    /// The mode flag consulted on every overflow.
    pub fn mode(&self) -> &ModeFlag {
        &self.mode
    }

    /// Snapshot of the event counters.
    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            handled: self.handled.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
            degenerate: self.degenerate.load(Ordering::Relaxed),
            dropped: self.samples.dropped(),
        }
    }

    fn read_sample(&self, ctl: IbsOpCtl) -> Sample {
        let regs = &*self.registers;
        let tgt_rip = match self.mode.get() {
            Mode::Precise => regs.read(msr::BP_IBSTGT_RIP),
            Mode::Measure => 0,
        };
        Sample {
            ctl: ctl.0,
            rip: regs.read(msr::IBS_OP_RIP),
            data: regs.read(msr::IBS_OP_DATA),
            data2: regs.read(msr::IBS_OP_DATA2),
            data3: regs.read(msr::IBS_OP_DATA3),
            linad: regs.read(msr::IBS_DC_LIN_AD),
            phyad: regs.read(msr::IBS_DC_PHYS_AD),
            tgt_rip,
        }
    }
}

impl NmiHandler for Collector {
    fn handle(&self) -> NmiStatus {
        let ctl = IbsOpCtl(self.registers.read(msr::IBS_OP_CTL));
        if !ctl.is_valid() {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            return NmiStatus::NotHandled;
        }

        if ctl.is_degenerate() {
            self.degenerate.fetch_add(1, Ordering::Relaxed);
            self.registers.write(msr::IBS_OP_CTL, ctl.acknowledged().0);
            return NmiStatus::Handled;
        }

        let sample = self.read_sample(ctl);
        self.samples.append_sample(&sample);
        msr::rearm(&*self.registers, ctl, &self.randomizer);
        self.handled.fetch_add(1, Ordering::Relaxed);
        NmiStatus::Handled
    }
}

impl core::fmt::Debug for Collector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collector")
            .field("samples", &self.samples)
            .field("mode", &self.mode.get())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
