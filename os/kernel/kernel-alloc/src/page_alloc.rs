//! # Page Allocator Interface
//!
//! The heap and the thread stacks draw whole pages from a [`PageAlloc`].
//! The kernel's physical memory manager implements it; [`BumpPageAlloc`]
//! covers early boot until that exists.

use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE_BYTES;

/// Source of page-aligned, page-granular memory.
///
/// Implementations are shared between subsystems, hence `&self`.
pub trait PageAlloc {
    /// Allocate `count` contiguous pages, page aligned.
    ///
    /// Returns `None` when memory is exhausted.
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>>;

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Safety
    /// `base` and `count` must match a previous allocation from this
    /// allocator, and nothing may reference the pages afterwards.
    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize);
}

impl<P: PageAlloc + ?Sized> PageAlloc for &P {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        (**self).alloc_pages(count)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        unsafe { (**self).free_pages(base, count) }
    }
}

impl<P: PageAlloc + ?Sized> PageAlloc for Arc<P> {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        (**self).alloc_pages(count)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        unsafe { (**self).free_pages(base, count) }
    }
}

/// Early-boot page allocator over a fixed, page-aligned range.
///
/// Hands out pages by bumping a cursor. Only the most recent allocation can
/// be returned; anything else freed is leaked until a real PMM takes over.
pub struct BumpPageAlloc {
    next: AtomicUsize,
    start: usize,
    end: usize,
}

impl BumpPageAlloc {
    /// # Safety
    /// `[start, end)` must be valid, writable, page aligned and exclusively
    /// owned by this allocator for as long as it hands out pages.
    #[must_use]
    pub const unsafe fn new(start: usize, end: usize) -> Self {
        Self {
            next: AtomicUsize::new(start),
            start,
            end,
        }
    }

    #[must_use]
    pub fn remaining_pages(&self) -> usize {
        (self.end - self.next.load(Ordering::Relaxed)) / PAGE_SIZE_BYTES
    }

    #[must_use]
    pub fn used_pages(&self) -> usize {
        (self.next.load(Ordering::Relaxed) - self.start) / PAGE_SIZE_BYTES
    }
}

impl PageAlloc for BumpPageAlloc {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(PAGE_SIZE_BYTES)?;
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            let new = cur.checked_add(bytes).filter(|n| *n <= self.end)?;
            match self
                .next
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return NonNull::new(cur as *mut u8),
                Err(seen) => cur = seen,
            }
        }
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        let base = base.as_ptr() as usize;
        let end = base + count * PAGE_SIZE_BYTES;
        if self
            .next
            .compare_exchange(end, base, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            log::trace!("bump pages: leaking {count} page(s) at {base:#x}");
        }
    }
}
