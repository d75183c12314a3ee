//! Loom compatibility shim.
//!
//! Under `cfg(loom)` the lock-free sample path is built on loom's atomics so
//! it can be model-checked; otherwise these are the `core` types.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
