//! Fakes for the platform seams, shared by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::dispatch::{Dispatcher, Task};
use crate::error::{Error, Result};
use crate::msr::{self, IBS_OP_CTL, IbsOpCtl, Msr, OpCtlFlags};
use crate::platform::{
    EntryArgs, EntryGlue, MemoryServices, NmiHandler, NmiStatus, NotifyLine, Platform,
    SamplingRegisters,
};
use crate::protocol::{UserSink, UserSource};

/// Branch target latched by [`latch_sample`].
pub const LATCHED_TARGET: u64 = 0x7000_0000;

/// An in-memory register bank that logs every write.
#[derive(Debug, Default)]
pub struct FakeRegisters {
    values: Mutex<BTreeMap<u32, u64>>,
    writes: Mutex<Vec<(Msr, u64)>>,
    unsupported: AtomicBool,
}

impl FakeRegisters {
    pub fn writes(&self) -> Vec<(Msr, u64)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_unsupported(&self) {
        self.unsupported.store(true, Ordering::Relaxed);
    }
}

impl SamplingRegisters for FakeRegisters {
    fn read(&self, msr: Msr) -> u64 {
        self.values.lock().unwrap().get(&msr.addr()).copied().unwrap_or(0)
    }

    fn write(&self, msr: Msr, value: u64) {
        self.values.lock().unwrap().insert(msr.addr(), value);
        self.writes.lock().unwrap().push((msr, value));
    }

    fn check_support(&self) -> Result<()> {
        if self.unsupported.load(Ordering::Relaxed) {
            Err(Error::Unsupported("fake registers marked unsupported"))
        } else {
            Ok(())
        }
    }
}

/// Latches a valid sample at `rip` on top of the current control value.
pub fn latch_sample(regs: &FakeRegisters, rip: u64) {
    let ctl = IbsOpCtl(regs.read(IBS_OP_CTL));
    regs.write(IBS_OP_CTL, ctl.0 | OpCtlFlags::VALID.bits());
    regs.write(msr::IBS_OP_RIP, rip);
    regs.write(msr::BP_IBSTGT_RIP, LATCHED_TARGET);
}

/// A notification line that tests raise by hand.
#[derive(Default)]
pub struct FakeLine {
    handler: Mutex<Option<Arc<dyn NmiHandler>>>,
}

impl FakeLine {
    pub fn fire(&self) -> NmiStatus {
        let handler = self.handler.lock().unwrap().clone();
        handler.map_or(NmiStatus::NotHandled, |h| h.handle())
    }

    pub fn is_attached(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }
}

impl NotifyLine for FakeLine {
    fn attach(&self, handler: Arc<dyn NmiHandler>) -> Result<()> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn detach(&self) {
        self.handler.lock().unwrap().take();
    }
}

/// Tracks which addresses are executable and maps virtual to physical 1:1.
#[derive(Debug, Default)]
pub struct FakeMemory {
    executable: Mutex<HashSet<usize>>,
}

impl FakeMemory {
    pub fn is_executable(&self, addr: usize) -> bool {
        self.executable.lock().unwrap().contains(&addr)
    }
}

impl MemoryServices for FakeMemory {
    unsafe fn set_executable(&self, addr: usize, _pages: usize) -> Result<()> {
        self.executable.lock().unwrap().insert(addr);
        Ok(())
    }

    unsafe fn set_non_executable(&self, addr: usize, _pages: usize) -> Result<()> {
        self.executable.lock().unwrap().remove(&addr);
        Ok(())
    }

    fn physical_address(&self, addr: usize) -> Option<u64> {
        Some(addr as u64)
    }
}

/// Runs each task on a fresh thread standing in for the target unit.
#[derive(Debug)]
pub struct SpawnDispatcher {
    target: u32,
    online: bool,
    dispatched: AtomicUsize,
}

impl SpawnDispatcher {
    pub fn new(target: u32) -> Self {
        Self { target, online: true, dispatched: AtomicUsize::new(0) }
    }

    pub fn offline(target: u32) -> Self {
        Self { online: false, ..Self::new(target) }
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl Dispatcher for SpawnDispatcher {
    fn target(&self) -> u32 {
        self.target
    }

    fn dispatch(&self, task: Task) -> Result<()> {
        if !self.online {
            return Err(Error::TargetOffline(self.target));
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        std::thread::spawn(task);
        Ok(())
    }
}

type GlueFn = dyn Fn(&[u8], EntryArgs) -> u64 + Send + Sync;

/// Entry glue that calls a closure instead of the code buffer.
pub struct FnGlue(Box<GlueFn>);

impl FnGlue {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8], EntryArgs) -> u64 + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    pub fn returning(value: u64) -> Self {
        Self::new(move |_, _| value)
    }
}

impl EntryGlue for FnGlue {
    unsafe fn call(&self, code: &[u8], args: EntryArgs) -> u64 {
        (self.0)(code, args)
    }
}

/// A source whose copy always faults.
#[derive(Debug, Clone, Copy)]
pub struct FaultingSource(pub usize);

impl UserSource for FaultingSource {
    fn len(&self) -> usize {
        self.0
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        // Scribble over part of the destination first, like a copy that
        // faults half-way.
        let half = dst.len() / 2;
        dst[..half].fill(0xcc);
        Err(Error::Fault)
    }
}

/// A sink whose copy always faults.
#[derive(Debug, Clone, Copy)]
pub struct FaultingSink;

impl UserSink for FaultingSink {
    fn copy_from(&mut self, _src: &[u8]) -> Result<()> {
        Err(Error::Fault)
    }
}

/// One set of fakes wired into a [`Platform`].
pub struct TestRig {
    pub registers: Arc<FakeRegisters>,
    pub line: Arc<FakeLine>,
    pub dispatcher: Arc<SpawnDispatcher>,
    pub memory: Arc<FakeMemory>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_dispatcher(SpawnDispatcher::new(4))
    }

    pub fn offline() -> Self {
        Self::with_dispatcher(SpawnDispatcher::offline(4))
    }

    fn with_dispatcher(dispatcher: SpawnDispatcher) -> Self {
        Self {
            registers: Arc::new(FakeRegisters::default()),
            line: Arc::new(FakeLine::default()),
            dispatcher: Arc::new(dispatcher),
            memory: Arc::new(FakeMemory::default()),
        }
    }

    pub fn platform(&self, glue: FnGlue) -> Platform {
        Platform {
            registers: self.registers.clone(),
            line: self.line.clone(),
            dispatcher: self.dispatcher.clone(),
            glue: Arc::new(glue),
            memory: self.memory.clone(),
        }
    }
}
