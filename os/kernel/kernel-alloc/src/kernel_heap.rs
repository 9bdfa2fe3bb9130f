//! # Kernel Heap
//!
//! The process-wide [`Heap`] instance behind a spin lock that is taken with
//! interrupts disabled. The critical section does bounded work (one chunk
//! list walk, at most one page allocation) and never blocks.

use crate::heap::{CHUNK_ALIGN, Heap, HeapError, HeapStats};
use crate::PageAlloc;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use kernel_info::HeapConfig;
use kernel_sync::SpinLock;

pub struct KernelHeap<P: PageAlloc> {
    inner: SpinLock<Option<Heap<P>>>,
}

impl<P: PageAlloc> Default for KernelHeap<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageAlloc> KernelHeap<P> {
    /// An uninitialized heap, suitable for a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Create the root block.
    ///
    /// # Errors
    /// [`HeapError::AlreadyInitialized`] on a second call, or the error of
    /// [`Heap::new`].
    pub fn init(&self, pages: P, config: HeapConfig) -> Result<(), HeapError> {
        let mut heap = self.inner.lock_irq();
        if heap.is_some() {
            return Err(HeapError::AlreadyInitialized);
        }
        *heap = Some(Heap::new(pages, config)?);
        log::info!(
            "kernel heap: initialized with {} root pages, {}-page growth",
            config.root_pages,
            config.block_pages
        );
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock_irq().is_some()
    }

    /// # Errors
    /// [`HeapError::Uninitialized`] before [`init`](Self::init); otherwise
    /// see [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.inner
            .lock_irq()
            .as_mut()
            .ok_or(HeapError::Uninitialized)?
            .allocate(size)
    }

    /// # Safety
    /// See [`Heap::release`].
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        let mut heap = self.inner.lock_irq();
        match heap.as_mut() {
            // Safety: forwarded caller contract.
            Some(heap) => unsafe { heap.release(ptr) },
            None => panic!("kernel heap: release of {ptr:p} before initialization"),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Option<HeapStats> {
        self.inner.lock_irq().as_ref().map(Heap::stats)
    }

    /// Assert the heap's structural invariants.
    pub fn verify(&self) {
        if let Some(heap) = self.inner.lock_irq().as_ref() {
            heap.verify();
        }
    }
}

/// Payloads are [`CHUNK_ALIGN`]-aligned. A stricter layout over-allocates
/// by its alignment and keeps the chunk pointer in the word just below the
/// aligned address.
unsafe impl<P: PageAlloc + Send> GlobalAlloc for KernelHeap<P> {
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= CHUNK_ALIGN {
            return self
                .allocate(layout.size())
                .map_or(null_mut(), NonNull::as_ptr);
        }
        let Some(padded) = layout.size().checked_add(layout.align()) else {
            return null_mut();
        };
        let Ok(chunk) = self.allocate(padded) else {
            return null_mut();
        };
        let raw = chunk.as_ptr();
        let offset = layout.align() - (raw.addr() & (layout.align() - 1));
        // Safety: `offset` is in `CHUNK_ALIGN..=align`, so the aligned
        // payload and the word below it lie inside the padded chunk.
        unsafe {
            let aligned = raw.add(offset);
            aligned.cast::<*mut u8>().sub(1).write(raw);
            aligned
        }
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let chunk = if layout.align() <= CHUNK_ALIGN {
            ptr
        } else {
            // Safety: written by `alloc` for the same layout.
            unsafe { ptr.cast::<*mut u8>().sub(1).read() }
        };
        if let Some(chunk) = NonNull::new(chunk) {
            // Safety: GlobalAlloc contract.
            unsafe { self.release(chunk) };
        }
    }
}
