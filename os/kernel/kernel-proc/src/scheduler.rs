//! # Scheduler State
//!
//! Everything guarded by the scheduler lock: table membership of processes
//! and threads, the ready queue and per-process memory counters. Code that
//! holds a `&SchedulerState` holds the lock.

use crate::error::ProcessError;
use crate::id::{IdAllocator, ProcessId, ThreadId};
use crate::process::{MemoryUsage, Process};
use crate::thread::{Thread, ThreadState};
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use kernel_info::KernelConfig;

/// Process identifier to process.
///
/// An identifier is taken from the moment [`ProcessTable::next_id`] hands it
/// out. It stays taken while the process is in the table, while it is out
/// of the table but not yet torn down, and after teardown until its exit
/// status has been [reaped](ProcessTable::reap).
pub struct ProcessTable {
    entries: BTreeMap<ProcessId, Arc<Process>>,
    /// Handed out, not in `entries`, not torn down.
    reserved: BTreeSet<ProcessId>,
    /// Torn down, exit status not yet collected.
    exited: BTreeMap<ProcessId, i32>,
    ids: IdAllocator,
}

impl ProcessTable {
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            reserved: BTreeSet::new(),
            exited: BTreeMap::new(),
            ids: IdAllocator::new(limit),
        }
    }

    /// Draw and reserve an identifier nobody holds.
    ///
    /// # Errors
    /// [`ProcessError::TableFull`] once every identifier is taken.
    pub fn next_id(&mut self) -> Result<ProcessId, ProcessError> {
        let Self {
            entries,
            reserved,
            exited,
            ids,
        } = self;
        let id = ids
            .allocate(|raw| {
                let id = ProcessId::new(raw);
                entries.contains_key(&id) || reserved.contains(&id) || exited.contains_key(&id)
            })
            .map(ProcessId::new)
            .ok_or(ProcessError::TableFull)?;
        reserved.insert(id);
        Ok(id)
    }

    /// # Errors
    /// [`ProcessError::Busy`] if the identifier is already taken.
    pub fn insert(&mut self, process: Arc<Process>) -> Result<(), ProcessError> {
        let id = process.id();
        if self.entries.contains_key(&id) || self.exited.contains_key(&id) {
            return Err(ProcessError::Busy);
        }
        self.entries.insert(id, process);
        self.reserved.remove(&id);
        Ok(())
    }

    /// Take a process out of the table. Its identifier stays reserved until
    /// the process is [retired](Self::retire).
    pub fn remove(&mut self, id: ProcessId) -> Option<Arc<Process>> {
        let removed = self.entries.remove(&id)?;
        self.reserved.insert(id);
        Some(removed)
    }

    /// Remove `process` if it is the entry registered under its id.
    pub fn remove_entry(&mut self, process: &Arc<Process>) -> bool {
        let id = process.id();
        if self
            .entries
            .get(&id)
            .is_some_and(|p| Arc::ptr_eq(p, process))
        {
            self.remove(id);
            true
        } else {
            false
        }
    }

    /// Give back an identifier from [`Self::next_id`] that never made it
    /// into a process.
    pub fn release(&mut self, id: ProcessId) {
        self.reserved.remove(&id);
    }

    /// Drop a torn-down process. With a `status` the identifier is kept for
    /// [`Self::reap`]; without one it is free again.
    pub fn retire(&mut self, process: &Arc<Process>, status: Option<i32>) {
        let id = process.id();
        self.remove_entry(process);
        self.release(id);
        if let Some(status) = status {
            self.exited.insert(id, status);
        }
    }

    /// Collect the exit status of a retired process and free its identifier.
    pub fn reap(&mut self, id: ProcessId) -> Option<i32> {
        self.exited.remove(&id)
    }

    /// Retired processes whose status nobody has collected.
    #[must_use]
    pub fn exited_count(&self) -> usize {
        self.exited.len()
    }

    #[must_use]
    pub fn get(&self, id: ProcessId) -> Option<&Arc<Process>> {
        self.entries.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Process>> {
        self.entries.values()
    }
}

/// Thread identifier to thread. Identifiers are reserved from
/// [`ThreadTable::next_id`] until [`ThreadTable::remove`].
pub struct ThreadTable<D> {
    entries: BTreeMap<ThreadId, Arc<Thread<D>>>,
    reserved: BTreeSet<ThreadId>,
    ids: IdAllocator,
}

impl<D> ThreadTable<D> {
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            reserved: BTreeSet::new(),
            ids: IdAllocator::new(limit),
        }
    }

    /// Draw and reserve an identifier nobody holds.
    ///
    /// # Errors
    /// [`ProcessError::TableFull`] once every identifier is taken.
    pub fn next_id(&mut self) -> Result<ThreadId, ProcessError> {
        let Self {
            entries,
            reserved,
            ids,
        } = self;
        let id = ids
            .allocate(|raw| {
                let id = ThreadId::new(raw);
                entries.contains_key(&id) || reserved.contains(&id)
            })
            .map(ThreadId::new)
            .ok_or(ProcessError::TableFull)?;
        reserved.insert(id);
        Ok(id)
    }

    /// # Errors
    /// [`ProcessError::Busy`] if the identifier is already taken.
    pub fn insert(&mut self, thread: Arc<Thread<D>>) -> Result<(), ProcessError> {
        let id = thread.id();
        if self.entries.contains_key(&id) {
            return Err(ProcessError::Busy);
        }
        self.entries.insert(id, thread);
        self.reserved.remove(&id);
        Ok(())
    }

    /// Drop the entry or the bare reservation of `id`.
    pub fn remove(&mut self, id: ThreadId) -> Option<Arc<Thread<D>>> {
        self.reserved.remove(&id);
        self.entries.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<&Arc<Thread<D>>> {
        self.entries.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread<D>>> {
        self.entries.values()
    }
}

pub struct SchedulerState<D> {
    pub processes: ProcessTable,
    pub threads: ThreadTable<D>,
    ready: VecDeque<ThreadId>,
    usage: BTreeMap<ProcessId, MemoryUsage>,
    kernel_process: Option<ProcessId>,
}

impl<D> SchedulerState<D> {
    #[must_use]
    pub const fn new(config: &KernelConfig) -> Self {
        Self {
            processes: ProcessTable::new(config.max_processes),
            threads: ThreadTable::new(config.max_threads),
            ready: VecDeque::new(),
            usage: BTreeMap::new(),
            kernel_process: None,
        }
    }

    /// Queue `thread` to run.
    pub fn add_ready(&mut self, thread: &Thread<D>) {
        thread.set_state(ThreadState::Ready);
        self.ready.push_back(thread.id());
    }

    /// Next thread in line, round robin.
    pub fn next_ready(&mut self) -> Option<ThreadId> {
        let next = self.ready.pop_front()?;
        self.ready.push_back(next);
        Some(next)
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Drop `thread` from both the thread table and the ready queue.
    pub fn unlink_thread(&mut self, thread: ThreadId) -> Option<Arc<Thread<D>>> {
        self.ready.retain(|t| *t != thread);
        self.threads.remove(thread)
    }

    #[must_use]
    pub fn memory_usage(&self, process: ProcessId) -> MemoryUsage {
        self.usage.get(&process).copied().unwrap_or_default()
    }

    pub fn memory_usage_mut(&mut self, process: ProcessId) -> &mut MemoryUsage {
        self.usage.entry(process).or_default()
    }

    pub fn forget_memory_usage(&mut self, process: ProcessId) {
        self.usage.remove(&process);
    }

    #[must_use]
    pub const fn kernel_process(&self) -> Option<ProcessId> {
        self.kernel_process
    }

    pub(crate) const fn set_kernel_process(&mut self, process: ProcessId) {
        self.kernel_process = Some(process);
    }
}
