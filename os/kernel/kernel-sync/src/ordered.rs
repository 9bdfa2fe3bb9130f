//! # Lock ordering
//!
//! Every [`OrderedMutex`] carries a lock level `L`. Locking it consumes a
//! mutable borrow of a [`LockCtx`] at some level `P` and requires
//! `L: LockAfter<P>`. The returned guard can be [split](OrderedGuard::split)
//! into the protected value and a fresh context at level `L`, which is the
//! only way to take a further lock while the first one is held.
//!
//! The kernel's hierarchy is
//!
//! ```text
//! Unlocked ──► RegionLevel ──► SchedulerLevel
//!     └───────────────────────────────▲
//! ```
//!
//! so the scheduler lock may be taken while the region lock is held, but
//! not the other way around:
//!
//! ```compile_fail
//! use kernel_sync::ordered::{LockCtx, OrderedMutex, RegionLevel, SchedulerLevel};
//!
//! let regions: OrderedMutex<u32, RegionLevel> = OrderedMutex::new(0);
//! let sched: OrderedMutex<u32, SchedulerLevel> = OrderedMutex::new(0);
//!
//! let mut ctx = LockCtx::new();
//! let mut s = sched.lock(&mut ctx);
//! let (_, mut inner) = s.split();
//! let _r = regions.lock(&mut inner); // RegionLevel is not LockAfter<SchedulerLevel>
//! ```
//!
//! ```
//! use kernel_sync::ordered::{LockCtx, OrderedMutex, RegionLevel, SchedulerLevel};
//!
//! let regions: OrderedMutex<u32, RegionLevel> = OrderedMutex::new(0);
//! let sched: OrderedMutex<u32, SchedulerLevel> = OrderedMutex::new(0);
//!
//! let mut ctx = LockCtx::new();
//! let mut r = regions.lock(&mut ctx);
//! let (value, mut inner) = r.split();
//! *value += 1;
//! *sched.lock(&mut inner) += 1;
//! ```

use crate::{SpinLock, SpinLockGuard};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Marker for a position in the lock hierarchy.
pub trait LockLevel {}

/// `Self` may be acquired while a lock of level `Prior` is held.
pub trait LockAfter<Prior: LockLevel>: LockLevel {}

/// No lock held.
pub enum Unlocked {}

/// The region lock: all memory contexts and the global region-id table.
pub enum RegionLevel {}

/// The scheduler lock: process/thread table membership and accounting.
pub enum SchedulerLevel {}

impl LockLevel for Unlocked {}
impl LockLevel for RegionLevel {}
impl LockLevel for SchedulerLevel {}

impl LockAfter<Unlocked> for RegionLevel {}
impl LockAfter<Unlocked> for SchedulerLevel {}
impl LockAfter<RegionLevel> for SchedulerLevel {}

/// Proof of the current position in the lock hierarchy.
///
/// A context is borrowed mutably for as long as a lock taken through it is
/// held, so it cannot be reused to take a sibling lock out of order.
pub struct LockCtx<'a, L: LockLevel> {
    _level: PhantomData<(&'a mut (), L)>,
}

impl LockCtx<'static, Unlocked> {
    /// Root context for an entry point that holds no ordered lock.
    ///
    /// Only construct this at the boundary of the subsystem (system call
    /// entry, boot, tests); inner code receives a context from its caller.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _level: PhantomData,
        }
    }
}

impl Default for LockCtx<'static, Unlocked> {
    fn default() -> Self {
        Self::new()
    }
}

/// A spin lock that sits at level `L` of the lock hierarchy.
pub struct OrderedMutex<T, L: LockLevel> {
    inner: SpinLock<T>,
    _level: PhantomData<L>,
}

impl<T, L: LockLevel> OrderedMutex<T, L> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
            _level: PhantomData,
        }
    }

    /// Acquire the lock from a context at level `P`.
    #[inline]
    #[must_use]
    pub fn lock<'a, P: LockLevel>(
        &'a self,
        _ctx: &'a mut LockCtx<'_, P>,
    ) -> OrderedGuard<'a, T, L>
    where
        L: LockAfter<P>,
    {
        OrderedGuard {
            guard: self.inner.lock(),
            _level: PhantomData,
        }
    }

    /// Lock, run `f` with the value and a context at level `L`, unlock.
    #[inline]
    pub fn with_lock<P: LockLevel, U>(
        &self,
        ctx: &mut LockCtx<'_, P>,
        f: impl FnOnce(&mut T, &mut LockCtx<'_, L>) -> U,
    ) -> U
    where
        L: LockAfter<P>,
    {
        let mut guard = self.lock(ctx);
        let (value, mut inner) = guard.split();
        f(value, &mut inner)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct OrderedGuard<'a, T, L: LockLevel> {
    guard: SpinLockGuard<'a, T>,
    _level: PhantomData<L>,
}

impl<T, L: LockLevel> OrderedGuard<'_, T, L> {
    /// Split into the protected value and a context for nested locks.
    #[inline]
    pub fn split(&mut self) -> (&mut T, LockCtx<'_, L>) {
        (
            &mut self.guard,
            LockCtx {
                _level: PhantomData,
            },
        )
    }
}

impl<T, L: LockLevel> Deref for OrderedGuard<'_, T, L> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, L: LockLevel> DerefMut for OrderedGuard<'_, T, L> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
