//! # Kernel Heap Allocation
//!
//! Kernel-internal dynamic memory (`kmalloc`) on top of a page allocator.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 KernelHeap (GlobalAlloc)            │
//! │    • one global instance, IRQ-safe spin lock        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 Heap                                │
//! │    • page blocks, pushed at the list head           │
//! │    • first-fit chunks, split and coalesced          │
//! │    • in-band headers with magic values              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 PageAlloc                           │
//! │    • alloc_pages / free_pages (physical memory      │
//! │      manager, BumpPageAlloc during early boot)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Heap corruption (a clobbered header, a double free) is not an error the
//! caller can handle: the heap logs a diagnostic and panics, which halts
//! the kernel.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::{BumpPageAlloc, Heap};
//! use kernel_info::HeapConfig;
//!
//! #[repr(align(4096))]
//! struct Arena([u8; 8 * 4096]);
//!
//! let mut arena = Box::new(Arena([0; 8 * 4096]));
//! let start = arena.0.as_mut_ptr() as usize;
//! let pages = unsafe { BumpPageAlloc::new(start, start + 8 * 4096) };
//!
//! let config = HeapConfig { root_pages: 4, block_pages: 2, reclaim_empty_blocks: false };
//! let mut heap = Heap::new(&pages, config).unwrap();
//! let p = heap.allocate(64).unwrap();
//! unsafe { heap.release(p) };
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod heap;
#[cfg(any(test, feature = "host"))]
pub mod host;
mod kernel_heap;
pub mod page_alloc;

pub use heap::{BlockStats, Heap, HeapError, HeapStats};
#[cfg(any(test, feature = "host"))]
pub use host::HostPageAlloc;
pub use kernel_heap::KernelHeap;
pub use page_alloc::{BumpPageAlloc, PageAlloc};
