use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Counting semaphore.
///
/// Waiters spin; this crate has no scheduler to park them on. Kernel code
/// that may wait for long should prefer [`try_acquire`](Self::try_acquire)
/// and yield between attempts.
pub struct Semaphore {
    count: AtomicU32,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
        }
    }

    /// Take one unit if available.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
        false
    }

    /// Take one unit, spinning until one is released.
    pub fn acquire(&self) {
        while !self.try_acquire() {
            while self.count.load(Ordering::Relaxed) == 0 {
                spin_loop();
            }
        }
    }

    /// Release `n` units.
    pub fn release(&self, n: u32) {
        self.count.fetch_add(n, Ordering::Release);
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}
