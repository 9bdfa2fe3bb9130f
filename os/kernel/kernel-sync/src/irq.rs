//! # Interrupt-disabling locks
//!
//! On bare-metal `x86_64` the guard toggles `IF` via `cli`/`sti`. Hosted
//! builds (unit tests) have no interrupt flag to manage; the guard is a
//! no-op there and only the lock itself takes effect.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// A [`SpinLock`] guard that also keeps interrupts disabled while held.
///
/// Interrupts go off before the lock is taken and come back after it is
/// released, so an interrupt handler on the same CPU never spins on a lock
/// its own CPU holds. The kernel heap is locked this way.
pub struct IrqSpinLockGuard<'a, T> {
    // Declared first so it drops before the interrupt guard.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> SpinLock<T> {
    /// Lock with interrupts disabled for the lifetime of the guard.
    #[inline]
    #[must_use]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqSpinLockGuard {
            guard: self.lock(),
            _irq: irq,
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn interrupts_enabled() -> bool {
        false
    }

    #[inline]
    pub const fn disable() {}

    #[inline]
    pub const fn enable() {}
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Snapshots the interrupt flag; `sti` is issued on drop **only** if
/// interrupts were enabled before, so guards nest.
///
/// # Privilege
///
/// On bare metal this requires a context where `cli`/`sti` are legal.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = arch::interrupts_enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
