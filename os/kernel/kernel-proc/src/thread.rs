//! # Threads

use crate::id::ThreadId;
use crate::process::Process;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE_BYTES;
use kernel_sync::SpinLock;

/// Pages backing a thread's kernel stack.
#[derive(Debug)]
pub struct KernelStack {
    base: usize,
    pages: usize,
}

impl KernelStack {
    pub(crate) fn new(base: NonNull<u8>, pages: usize) -> Self {
        Self {
            base: base.as_ptr() as usize,
            pages,
        }
    }

    /// Lowest address of the stack.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the highest address; the initial stack pointer.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.base + self.pages * PAGE_SIZE_BYTES
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    pub(crate) fn as_non_null(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.base as *mut u8)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// Allocated, not in the thread table yet.
    Allocated,
    /// In the thread table and queued to run.
    Ready,
    /// Exited; waiting to be destroyed.
    Exited,
}

pub struct Thread<D> {
    id: ThreadId,
    name: String,
    process: Arc<Process>,
    state: SpinLock<ThreadState>,
    pub(crate) stack: SpinLock<Option<KernelStack>>,
    pub(crate) arch: SpinLock<Option<D>>,
}

impl<D> Thread<D> {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        process: Arc<Process>,
        stack: KernelStack,
        arch: D,
    ) -> Self {
        Self {
            id,
            name,
            process,
            state: SpinLock::new(ThreadState::Allocated),
            stack: SpinLock::new(Some(stack)),
            arch: SpinLock::new(Some(arch)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn process(&self) -> &Arc<Process> {
        &self.process
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    /// Run `f` with the architecture state, if the thread still has it.
    pub fn with_arch<U>(&self, f: impl FnOnce(&mut D) -> U) -> Option<U> {
        self.arch.lock().as_mut().map(f)
    }
}

impl<D> fmt::Debug for Thread<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("process", &self.process.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
