//! # Kernel synchronization primitives
//!
//! The memory subsystem's lock discipline is "mask hardware interrupts,
//! mutate, restore the prior interrupt state": there is one hardware thread
//! per processor and the only source of re-entry is an interrupt, so the
//! [`IrqGuard`] / [`IrqLock`] pair is what protects the paging state.
//! [`SpinLock`] exists for the few structures that genuinely see multiple
//! threads: host-side tests and the debug console sink.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqLock, interrupts_enabled};
pub use spin_lock::{SpinLock, SpinLockGuard};
