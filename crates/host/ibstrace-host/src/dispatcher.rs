//! A worker thread standing in for the target unit.
//!
//! Tasks are queued over a channel and run in submission order on one
//! dedicated thread, optionally pinned to the configured CPU.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use ibstrace_core::dispatch::{Dispatcher, Task};
use ibstrace_core::{Error, Result};

/// Pins the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: u32) -> io::Result<()> {
    let cpu = usize::try_from(cpu).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    // SAFETY: `cpu_set_t` is plain bits, and the set is fully initialized
    // before it is handed to the kernel.
    let ret = unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pins the calling thread to `cpu`.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: u32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Runs dispatched tasks on a dedicated thread.
#[derive(Debug)]
pub struct ThreadDispatcher {
    cpu: u32,
    tx: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    /// Starts the worker for `cpu`.
    ///
    /// With `pin` set the worker is bound to that CPU, and a CPU that does
    /// not exist or is offline is reported as
    /// [`Error::TargetOffline`].
    pub fn spawn(cpu: u32, pin: bool) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();

        let worker = thread::Builder::new()
            .name(format!("ibstrace-cpu{cpu}"))
            .spawn(move || {
                let pinned = if pin { pin_to_cpu(cpu) } else { Ok(()) };
                let ok = pinned.is_ok();
                let _ = ready_tx.send(pinned);
                if !ok {
                    return;
                }
                for task in rx {
                    task();
                }
            })
            .map_err(|e| Error::platform("spawn target-unit worker", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("ibstrace: cannot pin worker to cpu #{cpu}: {e}");
                let _ = worker.join();
                return Err(Error::TargetOffline(cpu));
            }
            Err(_) => return Err(Error::TargetOffline(cpu)),
        }

        if pin {
            log::debug!("ibstrace: worker pinned to cpu #{cpu}");
        } else {
            log::debug!("ibstrace: unpinned worker standing in for cpu #{cpu}");
        }
        Ok(Self { cpu, tx: Some(tx), worker: Some(worker) })
    }
}

impl Dispatcher for ThreadDispatcher {
    fn target(&self) -> u32 {
        self.cpu
    }

    fn dispatch(&self, task: Task) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::TargetOffline(self.cpu))?;
        tx.send(task).map_err(|_| Error::TargetOffline(self.cpu))
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once queued tasks drain.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("ibstrace: cpu #{} worker panicked", self.cpu);
            }
        }
    }
}
