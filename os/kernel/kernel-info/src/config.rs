//! # Runtime Configuration

use crate::limits::{KERNEL_STACK_PAGES, MAX_PROCESS_COUNT, MAX_THREAD_COUNT};
use crate::memory::{
    FIRST_KERNEL_ADDRESS, FIRST_USER_ADDRESS, KMALLOC_BLOCK_PAGES, KMALLOC_ROOT_PAGES,
    LAST_KERNEL_ADDRESS, LAST_USER_ADDRESS,
};

/// Sizing of the kernel heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    /// Pages in the root block created at initialization.
    pub root_pages: usize,
    /// Minimum pages per block grown on demand.
    pub block_pages: usize,
    /// Return a non-root block to the page allocator once all of it is free.
    pub reclaim_empty_blocks: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            root_pages: KMALLOC_ROOT_PAGES,
            block_pages: KMALLOC_BLOCK_PAGES,
            reclaim_empty_blocks: false,
        }
    }
}

/// Inclusive address bounds of the user and kernel halves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressLayout {
    pub first_user: u64,
    pub last_user: u64,
    pub first_kernel: u64,
    pub last_kernel: u64,
}

impl AddressLayout {
    /// The `(first, last)` bounds of the requested half.
    #[must_use]
    pub const fn bounds(&self, kernel: bool) -> (u64, u64) {
        if kernel {
            (self.first_kernel, self.last_kernel)
        } else {
            (self.first_user, self.last_user)
        }
    }
}

impl Default for AddressLayout {
    fn default() -> Self {
        Self {
            first_user: FIRST_USER_ADDRESS,
            last_user: LAST_USER_ADDRESS,
            first_kernel: FIRST_KERNEL_ADDRESS,
            last_kernel: LAST_KERNEL_ADDRESS,
        }
    }
}

/// Limits of the process and thread tables.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelConfig {
    pub max_processes: u32,
    pub max_threads: u32,
    pub kernel_stack_pages: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: MAX_PROCESS_COUNT,
            max_threads: MAX_THREAD_COUNT,
            kernel_stack_pages: KERNEL_STACK_PAGES,
        }
    }
}
