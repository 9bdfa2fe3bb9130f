//! # Host Page Allocator
//!
//! [`PageAlloc`] on top of the host's global allocator, with an optional
//! page budget and one-shot failure injection. Used by the test suites of
//! this crate and its dependents.

extern crate std;

use crate::PageAlloc;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE_BYTES;

const UNLIMITED: usize = usize::MAX;

#[derive(Default)]
pub struct HostPageAlloc {
    budget: AtomicUsize,
    outstanding: AtomicUsize,
    calls: AtomicUsize,
    fail_at: AtomicUsize,
}

impl HostPageAlloc {
    /// No page limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_budget(UNLIMITED)
    }

    /// At most `pages` pages outstanding at any time.
    #[must_use]
    pub const fn with_budget(pages: usize) -> Self {
        Self {
            budget: AtomicUsize::new(pages),
            outstanding: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(UNLIMITED),
        }
    }

    /// Make the `n`-th allocation from now (zero based) fail.
    pub fn fail_nth(&self, n: usize) {
        let calls = self.calls.load(Ordering::SeqCst);
        self.fail_at.store(calls + n, Ordering::SeqCst);
    }

    /// Make every allocation fail until [`recover`](Self::recover).
    pub fn exhaust(&self) {
        self.budget.store(0, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.budget.store(UNLIMITED, Ordering::SeqCst);
        self.fail_at.store(UNLIMITED, Ordering::SeqCst);
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn layout(count: usize) -> Option<Layout> {
        Layout::from_size_align(count.checked_mul(PAGE_SIZE_BYTES)?, PAGE_SIZE_BYTES).ok()
    }
}

impl PageAlloc for HostPageAlloc {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_at.load(Ordering::SeqCst) {
            return None;
        }
        if count == 0 {
            return None;
        }
        let budget = self.budget.load(Ordering::SeqCst);
        if self.outstanding().saturating_add(count) > budget {
            return None;
        }
        let layout = Self::layout(count)?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        if let Some(layout) = Self::layout(count) {
            unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
            self.outstanding.fetch_sub(count, Ordering::SeqCst);
        }
    }
}
