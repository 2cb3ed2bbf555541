//! Atomics used by the lock-free parts of the crate.
//!
//! Under `--cfg loom` these resolve to loom's model-checked versions.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicPtr, Ordering};
