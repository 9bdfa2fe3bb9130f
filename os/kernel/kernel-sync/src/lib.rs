//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: test-and-test-and-set lock for short per-object state.
//! * [`SpinLock::lock_irq`]: the same lock held with interrupts disabled,
//!   used by the kernel heap.
//! * [`OrderedMutex`]: a spin lock tagged with a lock level. Acquiring it
//!   needs a [`LockCtx`] of a lower level, so the region lock can never be
//!   taken while the scheduler lock is held.
//! * [`Semaphore`]: counting semaphore used for process exit waiters.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
pub mod ordered;
mod semaphore;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLockGuard};
pub use ordered::{LockAfter, LockCtx, LockLevel, OrderedGuard, OrderedMutex};
pub use semaphore::Semaphore;
pub use spin_lock::{SpinLock, SpinLockGuard};
