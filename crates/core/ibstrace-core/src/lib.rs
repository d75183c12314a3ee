//! Execution-dispatch and sampling coordinator for AMD IBS.
//!
//! This crate runs operator-supplied machine code on one designated
//! processing unit (the *target unit*) while the IBS op-sampling facility
//! overflows and the [`collector`] appends one [`Sample`] per overflow into a
//! pre-allocated, lock-free [`store::SampleBuffer`].
//!
//! The hardware and OS facilities the coordinator depends on are injected
//! through the traits in [`platform`] and [`dispatch`], so every piece here
//! is testable on the host with fakes. `ibstrace-host` provides the hosted
//! implementations and a simulated IBS unit.
//!
//! Control flow is **upload → trigger → drain**, driven through
//! [`Coordinator`] either with the typed API or the numeric command
//! protocol in [`protocol`].

pub mod arch;
pub mod code;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub(crate) mod loom_compat;
pub mod msr;
pub mod platform;
pub mod protocol;
pub mod sample;
pub mod store;
pub mod sync;
pub mod trampoline;

pub use config::Config;
pub use coordinator::{Coordinator, Diagnostics, TriggerMode, TriggerOutcome};
pub use error::{Error, Result};
pub use sample::Sample;

#[cfg(test)]
pub(crate) mod testutil;
