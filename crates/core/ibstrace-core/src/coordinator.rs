//! The coordinator object: one instance owns every buffer and the lock.
//!
//! Upload, trigger, drain, and the count/capacity queries are serialized by
//! a single mutex. A trigger holds it for the whole remote execution, so
//! samples appended during one trigger can never interleave with a drain or
//! with a second trigger. The collector is the only writer that bypasses the
//! lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::code::{CodeBuffer, ScratchRegion};
use crate::collector::{Collector, CollectorStats};
use crate::config::Config;
use crate::dispatch::{self, Rendezvous};
use crate::error::{Error, Result};
use crate::msr::Lfsr4;
use crate::platform::{EntryArgs, NmiHandler, Platform};
use crate::protocol::{MAX_OFFSET, UserSink, UserSource};
use crate::sample::Sample;
use crate::store::Mode;
use crate::sync::Completion;
use crate::trampoline::Trampoline;

/// How the program is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Plain measurement: `(scratch, 0, 0)`.
    Measure,
    /// Precise measurement: `(scratch, arg, offset)`, branch targets latched.
    Precise {
        /// Opaque pointer argument.
        arg: u64,
        /// Target offset into the code buffer, at most [`MAX_OFFSET`].
        offset: u64,
    },
}

impl TriggerMode {
    fn mode(self) -> Mode {
        match self {
            Self::Measure => Mode::Measure,
            Self::Precise { .. } => Mode::Precise,
        }
    }
}

/// What a completed trigger reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    /// The program's return-value register.
    pub return_value: u64,
    /// Records collected so far, including earlier triggers not yet drained.
    pub sample_count: usize,
}

/// Addresses and counters for operator debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Target unit.
    pub target_cpu: u32,
    /// Code buffer base address.
    pub code_addr: usize,
    /// Committed program length.
    pub code_len: usize,
    /// Code buffer capacity in bytes.
    pub code_capacity: usize,
    /// Sample buffer base address.
    pub sample_addr: usize,
    /// Records collected since the last drain.
    pub sample_count: usize,
    /// Sample buffer capacity in records.
    pub sample_capacity: usize,
    /// Scratch page virtual address.
    pub scratch_addr: usize,
    /// Scratch page physical address, if known.
    pub scratch_phys: Option<u64>,
    /// Return value of the last completed trigger.
    pub last_return: Option<u64>,
    /// A timed-out trigger is still running.
    pub busy: bool,
    /// Collector event counters.
    pub collector: CollectorStats,
}

/// State reached from the target unit while a trigger runs.
struct Shared {
    code: Mutex<CodeBuffer>,
    code_addr: usize,
    scratch: ScratchRegion,
    trampoline: Trampoline,
}

impl Shared {
    fn code(&self) -> MutexGuard<'_, CodeBuffer> {
        // Uploads either commit fully or leave nothing committed, so the
        // buffer is consistent even if a holder panicked.
        self.code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of the dispatched task.
    fn run(&self, mode: TriggerMode) -> u64 {
        let code = self.code();
        let scratch = self.scratch.addr() as u64;
        let args = match mode {
            TriggerMode::Measure => EntryArgs { scratch, arg: 0, offset: 0 },
            TriggerMode::Precise { arg, offset } => EntryArgs { scratch, arg, offset },
        };
        // SAFETY: the dispatcher runs this on the target unit, and `code` is
        // the committed contents of the executable code buffer.
        unsafe { self.trampoline.run(code.code(), args) }
    }
}

/// The mutable part of the coordinator lock.
#[derive(Debug, Default)]
struct Inner {
    /// Completion of a trigger whose bounded wait expired.
    pending: Option<Arc<Completion<u64>>>,
    last_return: Option<u64>,
}

/// The execution-dispatch and sampling coordinator.
pub struct Coordinator {
    config: Config,
    platform: Platform,
    shared: Arc<Shared>,
    collector: Arc<Collector>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    /// Starts the coordinator.
    ///
    /// Checks for the sampling facility (unless `config.sampling` is off),
    /// allocates every buffer, marks the code buffer executable, and binds
    /// the collector to the notification line. Any failure is fatal.
    pub fn new(config: Config, platform: Platform) -> Result<Self> {
        config.validate()?;
        let seed = Lfsr4::new(config.lfsr_seed)
            .ok_or(Error::InvalidConfig("lfsr_seed must be a non-zero 4-bit value"))?;
        if platform.dispatcher.target() != config.target_cpu {
            return Err(Error::InvalidConfig("dispatcher does not serve target_cpu"));
        }

        if config.sampling {
            platform.registers.check_support().inspect_err(|e| {
                log::error!("ibstrace: sampling facility unavailable: {e}");
            })?;
        } else {
            log::info!("ibstrace: sampling disabled, payloads run unmeasured");
        }

        let code = CodeBuffer::new(config.code_pages, Arc::clone(&platform.memory))?;
        let scratch = ScratchRegion::new(&*platform.memory)?;
        let trampoline = Trampoline::new(
            Arc::clone(&platform.registers),
            Arc::clone(&platform.glue),
            config.sampling,
            config.sample_period,
        );
        let collector = Arc::new(Collector::new(
            Arc::clone(&platform.registers),
            config.sample_capacity,
            seed,
        ));
        platform.line.attach(Arc::clone(&collector) as Arc<dyn NmiHandler>)?;

        log::info!(
            "ibstrace: ready on cpu #{} ({} code bytes, {} sample slots, period {:#x})",
            config.target_cpu,
            code.capacity(),
            config.sample_capacity,
            config.sample_period
        );

        Ok(Self {
            config,
            platform,
            shared: Arc::new(Shared {
                code_addr: code.addr(),
                code: Mutex::new(code),
                scratch,
                trampoline,
            }),
            collector,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// The configuration this coordinator was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Takes the coordinator lock and checks that no timed-out trigger is
    /// still running.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().map_err(|_| Error::Poisoned)?;
        if let Some(pending) = &inner.pending {
            let Some(ret) = pending.try_take() else {
                return Err(Error::Busy);
            };
            log::info!("ibstrace: timed-out payload finished (returned {ret:#x})");
            inner.pending = None;
            inner.last_return = Some(ret);
        }
        Ok(inner)
    }

    /// Replaces the program with `bytes`.
    pub fn upload(&self, bytes: &[u8]) -> Result<()> {
        self.upload_from(&bytes).map(|_| ())
    }

    /// Replaces the program with the contents of `src`.
    pub fn upload_from(&self, src: &dyn UserSource) -> Result<usize> {
        let _inner = self.lock()?;
        let len = self.shared.code().load(src)?;
        log::debug!("ibstrace: uploaded {len} bytes");
        Ok(len)
    }

    /// Runs the program once on the target unit and waits for it.
    pub fn trigger(&self, mode: TriggerMode) -> Result<TriggerOutcome> {
        let mut inner = self.lock()?;
        if self.shared.code().is_empty() {
            return Err(Error::NoCode);
        }
        if let TriggerMode::Precise { offset, .. } = mode {
            if offset > MAX_OFFSET {
                return Err(Error::OffsetTooLarge { offset, max: MAX_OFFSET });
            }
        }

        self.collector.mode().set(mode.mode());
        let shared = Arc::clone(&self.shared);
        let rendezvous = dispatch::call_on_target(
            &*self.platform.dispatcher,
            self.config.dispatch_timeout(),
            move || shared.run(mode),
        )?;

        match rendezvous {
            Rendezvous::Done(return_value) => {
                inner.last_return = Some(return_value);
                let sample_count = self.collector.samples().sample_count();
                log::debug!(
                    "ibstrace: {mode:?} returned {return_value:#x}, {sample_count} samples"
                );
                Ok(TriggerOutcome { return_value, sample_count })
            }
            Rendezvous::TimedOut(pending) => {
                log::warn!(
                    "ibstrace: cpu #{} did not finish within {:?}",
                    self.config.target_cpu,
                    self.config.dispatch_timeout()
                );
                inner.pending = Some(pending);
                Err(Error::Timeout)
            }
        }
    }

    /// Number of records collected since the last drain.
    pub fn sample_count(&self) -> Result<usize> {
        let _inner = self.lock()?;
        Ok(self.collector.samples().sample_count())
    }

    /// Sample buffer capacity in records.
    pub fn capacity(&self) -> Result<usize> {
        let _inner = self.lock()?;
        Ok(self.collector.samples().capacity())
    }

    /// Returns up to `max_bytes` of packed records and clears the buffer.
    pub fn drain(&self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.drain_into(&mut out, max_bytes)?;
        Ok(out)
    }

    /// Drains every collected record.
    pub fn drain_samples(&self) -> Result<Vec<Sample>> {
        self.drain(usize::MAX).map(|bytes| Sample::parse_all(&bytes))
    }

    /// Copies up to `max_bytes` of packed records into `sink`, then clears
    /// the buffer.
    ///
    /// If the copy faults nothing is consumed.
    pub fn drain_into(&self, sink: &mut dyn UserSink, max_bytes: usize) -> Result<usize> {
        let _inner = self.lock()?;
        let samples = self.collector.samples();
        let bytes = samples.snapshot(max_bytes);
        if bytes.is_empty() {
            return Ok(0);
        }
        sink.copy_from(&bytes)?;
        samples.clear();
        Ok(bytes.len())
    }

    /// Reads word `index` of the scratch page.
    pub fn scratch_word(&self, index: usize) -> Result<Option<u64>> {
        let _inner = self.lock()?;
        Ok(self.shared.scratch.read_word(index))
    }

    /// Addresses and counters for operator debugging.
    ///
    /// Available even while a timed-out trigger is running.
    pub fn diagnostics(&self) -> Diagnostics {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let busy = inner.pending.as_ref().is_some_and(|p| !p.is_signaled());
        let samples = self.collector.samples();
        // A running trigger holds the code lock; report no length rather
        // than block on it.
        let code_len = self.shared.code.try_lock().map_or(0, |code| code.len());
        Diagnostics {
            target_cpu: self.config.target_cpu,
            code_addr: self.shared.code_addr,
            code_len,
            code_capacity: self.config.code_capacity(),
            sample_addr: samples.base_addr(),
            sample_count: samples.sample_count(),
            sample_capacity: samples.capacity(),
            scratch_addr: self.shared.scratch.addr(),
            scratch_phys: self.shared.scratch.physical_address(),
            last_return: inner.last_return,
            busy,
            collector: self.collector.stats(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let pending = match self.inner.get_mut() {
            Ok(inner) => inner.pending.take(),
            Err(poisoned) => poisoned.into_inner().pending.take(),
        };
        if let Some(pending) = pending {
            log::warn!("ibstrace: waiting for outstanding payload before shutdown");
            pending.wait();
        }
        self.platform.line.detach();
        log::info!("ibstrace: stopped");
    }
}

impl core::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}
