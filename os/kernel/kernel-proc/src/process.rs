//! # Processes
//!
//! A process owns one memory context, one I/O context and one semaphore
//! context. Threads share it through an [`Arc`] and account for themselves
//! in [`Process::thread_count`]; the process is destroyed once that count
//! drops to zero.

use crate::error::ProcessError;
use crate::id::ProcessId;
use crate::interfaces::{IoContext, SemaphoreContext};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_sync::{Semaphore, SpinLock};
use kernel_vmem::{MemoryContextId, RegionId};

/// The three contexts of a process. Unset until the creator fills them in.
#[derive(Default)]
pub struct ProcessContexts {
    pub memory: Option<MemoryContextId>,
    pub io: Option<Box<dyn IoContext>>,
    pub semaphores: Option<Box<dyn SemaphoreContext>>,
}

/// Virtual and physical memory counters, guarded by the scheduler lock.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MemoryUsage {
    pub vmem: u64,
    pub pmem: u64,
}

pub struct Process {
    id: ProcessId,
    name: SpinLock<String>,
    thread_count: AtomicU32,
    contexts: SpinLock<ProcessContexts>,
    heap_region: SpinLock<Option<RegionId>>,
    loader_data: SpinLock<Option<Arc<dyn Any + Send + Sync>>>,
    exit_status: SpinLock<Option<i32>>,
    published: AtomicBool,
    /// One unit is released when the last thread exits.
    waiters: Semaphore,
}

impl Process {
    pub(crate) fn new(id: ProcessId, name: &str) -> Result<Self, ProcessError> {
        Ok(Self {
            id,
            name: SpinLock::new(try_copy_str(name)?),
            thread_count: AtomicU32::new(0),
            contexts: SpinLock::new(ProcessContexts::default()),
            heap_region: SpinLock::new(None),
            loader_data: SpinLock::new(None),
            exit_status: SpinLock::new(None),
            published: AtomicBool::new(false),
            waiters: Semaphore::new(0),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    /// Run `f` with the current name.
    pub fn with_name<U>(&self, f: impl FnOnce(&str) -> U) -> U {
        f(&self.name.lock())
    }

    pub(crate) fn set_name(&self, name: &str) -> Result<(), ProcessError> {
        let name = try_copy_str(name)?;
        *self.name.lock() = name;
        Ok(())
    }

    /// Threads currently referring to the process.
    #[must_use]
    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Acquire)
    }

    pub(crate) fn attach_thread(&self) {
        self.thread_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` if this was the last thread.
    pub(crate) fn detach_thread(&self) -> bool {
        self.thread_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[must_use]
    pub fn memory_context(&self) -> Option<MemoryContextId> {
        self.contexts.lock().memory
    }

    /// Run `f` with the process contexts locked.
    pub fn with_contexts<U>(&self, f: impl FnOnce(&mut ProcessContexts) -> U) -> U {
        self.contexts.with_lock(f)
    }

    pub(crate) fn take_contexts(&self) -> ProcessContexts {
        core::mem::take(&mut *self.contexts.lock())
    }

    #[must_use]
    pub fn heap_region(&self) -> Option<RegionId> {
        *self.heap_region.lock()
    }

    pub fn set_heap_region(&self, region: Option<RegionId>) {
        *self.heap_region.lock() = region;
    }

    /// Data left by the program loader, shared with forked children.
    #[must_use]
    pub fn loader_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.loader_data.lock().clone()
    }

    pub fn set_loader_data(&self, data: Option<Arc<dyn Any + Send + Sync>>) {
        *self.loader_data.lock() = data;
    }

    /// Exit status once the last thread is gone.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.exit_status.lock().get_or_insert(status);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn set_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    /// Block until the last thread has exited, then return the status.
    pub fn wait(&self) -> i32 {
        self.waiters.acquire();
        self.waiters.release(1);
        self.exit_status().unwrap_or(0)
    }

    /// The exit status if the last thread has already exited.
    #[must_use]
    pub fn try_wait(&self) -> Option<i32> {
        if self.waiters.try_acquire() {
            self.waiters.release(1);
            Some(self.exit_status().unwrap_or(0))
        } else {
            None
        }
    }

    pub(crate) fn signal_exit(&self) {
        self.waiters.release(1);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("threads", &self.thread_count())
            .finish_non_exhaustive()
    }
}

pub(crate) fn try_copy_str(s: &str) -> Result<String, ProcessError> {
    let mut out = String::new();
    out.try_reserve_exact(s.len())
        .map_err(|_| ProcessError::OutOfMemory)?;
    out.push_str(s);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_accounting_reports_last_detach() {
        let p = Process::new(ProcessId::new(3), "init").unwrap();
        p.attach_thread();
        p.attach_thread();
        assert_eq!(p.thread_count(), 2);
        assert!(!p.detach_thread());
        assert!(p.detach_thread());
        assert_eq!(p.thread_count(), 0);
    }

    #[test]
    fn first_exit_status_wins() {
        let p = Process::new(ProcessId::new(3), "init").unwrap();
        assert_eq!(p.exit_status(), None);
        p.set_exit_status(4);
        p.set_exit_status(9);
        assert_eq!(p.exit_status(), Some(4));
    }

    #[test]
    fn waiters_pass_through_after_exit() {
        let p = Process::new(ProcessId::new(3), "init").unwrap();
        assert_eq!(p.try_wait(), None);
        p.set_exit_status(2);
        p.signal_exit();
        assert_eq!(p.try_wait(), Some(2));
        assert_eq!(p.wait(), 2);
        assert_eq!(p.try_wait(), Some(2));
    }

    #[test]
    fn rename_replaces_name() {
        let p = Process::new(ProcessId::new(3), "init").unwrap();
        p.set_name("shell").unwrap();
        assert!(p.with_name(|n| n == "shell"));
        assert!(p.take_contexts().memory.is_none());
    }
}
