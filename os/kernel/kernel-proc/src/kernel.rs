//! # Kernel Context
//!
//! [`Kernel`] bundles the memory manager, the scheduler state and the
//! collaborators the process core needs. There are no global tables: boot
//! code creates one instance, tests create as many as they like.
//!
//! Lock order is region lock, then scheduler lock. Every entry point takes
//! a [`LockCtx`] at the unlocked level and nests the two locks only through
//! [`MemoryManager`]; plain scheduler-table updates take the scheduler lock
//! alone and release it before calling back into memory management.

use crate::error::ProcessError;
use crate::id::{ProcessId, ThreadId};
use crate::interfaces::{ArchThread, IoContext, ProcessListener, SemaphoreContext};
use crate::process::{MemoryUsage, Process, try_copy_str};
use crate::scheduler::SchedulerState;
use crate::thread::{KernelStack, Thread, ThreadState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::PageAlloc;
use kernel_info::KernelConfig;
use kernel_sync::ordered::{SchedulerLevel, Unlocked};
use kernel_sync::{LockCtx, OrderedMutex, SpinLock};
use kernel_vmem::{
    AllocMethod, ArchMemory, MemoryContextError, MemoryManager, RegionFlags, RegionId,
};
use log::{debug, info, trace, warn};

pub type Scheduler<D> = OrderedMutex<SchedulerState<D>, SchedulerLevel>;

pub struct Kernel<M: ArchMemory, T: ArchThread, P: PageAlloc> {
    config: KernelConfig,
    memory: MemoryManager<M>,
    arch: T,
    pages: P,
    scheduler: Scheduler<T::ThreadData>,
    listeners: SpinLock<Vec<Arc<dyn ProcessListener>>>,
}

impl<M: ArchMemory, T: ArchThread, P: PageAlloc> Kernel<M, T, P> {
    #[must_use]
    pub fn new(config: KernelConfig, memory: MemoryManager<M>, arch: T, pages: P) -> Self {
        Self {
            scheduler: OrderedMutex::new(SchedulerState::new(&config)),
            config,
            memory,
            arch,
            pages,
            listeners: SpinLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryManager<M> {
        &self.memory
    }

    #[must_use]
    pub const fn arch(&self) -> &T {
        &self.arch
    }

    #[must_use]
    pub const fn pages(&self) -> &P {
        &self.pages
    }

    /// The scheduler lock and everything it guards.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<T::ThreadData> {
        &self.scheduler
    }

    pub fn add_listener(&self, listener: Arc<dyn ProcessListener>) {
        self.listeners.lock().push(listener);
    }

    /// Call every listener without holding any kernel lock.
    pub(crate) fn notify(&self, event: impl Fn(&dyn ProcessListener)) {
        let listeners: Vec<_> = self.listeners.lock().iter().cloned().collect();
        trace!("notifying {} process listeners", listeners.len());
        for listener in listeners {
            event(listener.as_ref());
        }
    }

    /// A process with a fresh identifier and no contexts. The identifier
    /// is reserved until the process is inserted or destroyed.
    ///
    /// # Errors
    /// [`ProcessError::TableFull`] or [`ProcessError::OutOfMemory`].
    pub fn allocate_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        name: &str,
    ) -> Result<Arc<Process>, ProcessError> {
        let id = self
            .scheduler
            .with_lock(lock, |s, _| s.processes.next_id())?;
        Process::new(id, name).map(Arc::new).inspect_err(|_| {
            self.scheduler
                .with_lock(lock, |s, _| s.processes.release(id));
        })
    }

    /// # Errors
    /// [`ProcessError::Busy`] if the identifier is taken.
    pub fn insert_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        process: &Arc<Process>,
    ) -> Result<(), ProcessError> {
        self.scheduler.with_lock(lock, |s, _| {
            s.processes.insert(Arc::clone(process))?;
            process.set_published();
            Ok::<_, ProcessError>(())
        })?;
        info!("process {:?} inserted", process.id());
        Ok(())
    }

    pub fn remove_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
    ) -> Option<Arc<Process>> {
        let removed = self.scheduler.with_lock(lock, |s, _| s.processes.remove(id));
        if removed.is_some() {
            info!("process {id:?} removed");
        }
        removed
    }

    pub fn get_process_by_id(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
    ) -> Option<Arc<Process>> {
        self.scheduler
            .with_lock(lock, |s, _| s.processes.get(id).cloned())
    }

    /// # Errors
    /// [`ProcessError::NotFound`] or [`ProcessError::OutOfMemory`].
    pub fn rename_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
        name: &str,
    ) -> Result<(), ProcessError> {
        let process = self
            .get_process_by_id(lock, id)
            .ok_or(ProcessError::NotFound)?;
        process.set_name(name)
    }

    /// Visit every process in the table, in identifier order, with the
    /// scheduler lock held.
    pub fn for_each_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        mut f: impl FnMut(&Arc<Process>),
    ) {
        self.scheduler.with_lock(lock, |s, _| {
            for process in s.processes.iter() {
                f(process);
            }
        });
    }

    pub fn process_count(&self, lock: &mut LockCtx<'_, Unlocked>) -> usize {
        self.scheduler.with_lock(lock, |s, _| s.processes.len())
    }

    pub fn thread_count(&self, lock: &mut LockCtx<'_, Unlocked>) -> usize {
        self.scheduler.with_lock(lock, |s, _| s.threads.len())
    }

    pub fn memory_usage(&self, lock: &mut LockCtx<'_, Unlocked>, id: ProcessId) -> MemoryUsage {
        self.scheduler.with_lock(lock, |s, _| s.memory_usage(id))
    }

    pub fn get_thread_by_id(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ThreadId,
    ) -> Option<Arc<Thread<T::ThreadData>>> {
        self.scheduler.with_lock(lock, |s, _| s.threads.get(id).cloned())
    }

    /// Tear down a process that has no threads and is not in the table.
    ///
    /// The memory context loses its regions and is destroyed; the I/O and
    /// semaphore contexts are dropped. A process that was ever published
    /// leaves its exit status behind for [`Self::wait_process`]; any other
    /// gives its identifier back.
    ///
    /// # Errors
    /// [`ProcessError::Busy`] if threads still refer to the process or it
    /// is still in the table.
    pub fn destroy_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        process: Arc<Process>,
    ) -> Result<(), ProcessError> {
        if process.thread_count() != 0 {
            return Err(ProcessError::Busy);
        }
        let listed = self.scheduler.with_lock(lock, |s, _| {
            s.processes
                .get(process.id())
                .is_some_and(|p| Arc::ptr_eq(p, &process))
        });
        if listed {
            return Err(ProcessError::Busy);
        }
        self.release_process(lock, process);
        Ok(())
    }

    /// Release the contexts of a process without threads, then drop it from
    /// the table in the same step that records its exit.
    fn release_process(&self, lock: &mut LockCtx<'_, Unlocked>, process: Arc<Process>) {
        let id = process.id();
        let contexts = process.take_contexts();
        if let Some(context) = contexts.memory {
            match self
                .memory
                .delete_regions(lock, context, &self.scheduler, |s| {
                    *s.memory_usage_mut(id) = MemoryUsage::default();
                }) {
                Ok(()) | Err(MemoryContextError::TornDown | MemoryContextError::KernelContext) => {}
                Err(e) => warn!("process {id:?}: regions not deleted: {e}"),
            }
            match self.memory.destroy_context(lock, context) {
                Ok(()) | Err(MemoryContextError::KernelContext) => {}
                Err(e) => warn!("process {id:?}: memory context not destroyed: {e}"),
            }
        }
        drop(contexts);

        let published = process.is_published();
        let status = published.then(|| process.exit_status().unwrap_or(0));
        self.scheduler.with_lock(lock, |s, _| {
            s.forget_memory_usage(id);
            s.processes.retire(&process, status);
        });

        debug!("process {id:?} destroyed");
        if published {
            self.notify(|l| l.process_destroyed(id));
        }
        process.signal_exit();
    }

    /// A thread of `process` with its kernel stack and register state,
    /// not yet in the thread table.
    ///
    /// # Errors
    /// [`ProcessError::TableFull`], [`ProcessError::OutOfMemory`] or the
    /// architecture's failure.
    pub fn allocate_thread(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        name: &str,
        process: &Arc<Process>,
    ) -> Result<Arc<Thread<T::ThreadData>>, ProcessError> {
        let id = self.scheduler.with_lock(lock, |s, _| s.threads.next_id())?;
        let built = self.build_thread(id, name, process);
        if built.is_err() {
            self.scheduler.with_lock(lock, |s, _| s.threads.remove(id));
        }
        built
    }

    fn build_thread(
        &self,
        id: ThreadId,
        name: &str,
        process: &Arc<Process>,
    ) -> Result<Arc<Thread<T::ThreadData>>, ProcessError> {
        let name = try_copy_str(name)?;

        let pages = self.config.kernel_stack_pages;
        let base = self
            .pages
            .alloc_pages(pages)
            .ok_or(ProcessError::OutOfMemory)?;
        let stack = KernelStack::new(base, pages);

        let data = match self.arch.allocate_thread(&stack) {
            Ok(data) => data,
            Err(e) => {
                // SAFETY: the pages were just allocated and nothing runs on them.
                unsafe { self.pages.free_pages(base, pages) };
                return Err(e);
            }
        };

        process.attach_thread();
        Ok(Arc::new(Thread::new(
            id,
            name,
            Arc::clone(process),
            stack,
            data,
        )))
    }

    /// Unlink a thread and release its stack and register state.
    ///
    /// When the thread was the last of its process, the process is torn
    /// down, leaves the table and its waiters are released. The kernel
    /// process is exempt; it outlives all of its threads.
    pub fn destroy_thread(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        thread: Arc<Thread<T::ThreadData>>,
    ) {
        let process = Arc::clone(thread.process());
        let last = self.scheduler.with_lock(lock, |s, _| {
            s.unlink_thread(thread.id());
            process.detach_thread() && s.kernel_process() != Some(process.id())
        });

        if let Some(stack) = thread.stack.lock().take()
            && let Some(base) = stack.as_non_null()
        {
            // SAFETY: the stack came from `self.pages` with this page count and
            // the thread is out of every table, so nothing runs on it.
            unsafe { self.pages.free_pages(base, stack.pages()) };
        }
        if let Some(data) = thread.arch.lock().take() {
            self.arch.destroy_thread(data);
        }
        trace!("thread {:?} destroyed", thread.id());
        drop(thread);

        if last {
            self.release_process(lock, process);
        }
    }

    /// Put a fully built process and its first thread into the tables and
    /// queue the thread.
    pub(crate) fn publish(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        process: &Arc<Process>,
        thread: &Arc<Thread<T::ThreadData>>,
    ) -> Result<(), ProcessError> {
        self.scheduler.with_lock(lock, |s, _| {
            s.processes.insert(Arc::clone(process))?;
            if let Err(e) = s.threads.insert(Arc::clone(thread)) {
                s.processes.remove(process.id());
                return Err(e);
            }
            s.add_ready(thread);
            process.set_published();
            Ok::<_, ProcessError>(())
        })?;
        info!(
            "process {:?} with thread {:?} is ready",
            process.id(),
            thread.id()
        );
        Ok(())
    }

    /// Create the kernel process around the kernel memory context.
    ///
    /// # Errors
    /// [`ProcessError::Memory`] if the kernel context already exists, or an
    /// allocation failure.
    pub fn init_kernel_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        name: &str,
    ) -> Result<ProcessId, ProcessError> {
        let process = self.allocate_process(lock, name)?;
        let id = process.id();
        let context = match self.memory.init_kernel_context(lock) {
            Ok(context) => context,
            Err(e) => {
                self.release_process(lock, process);
                return Err(e.into());
            }
        };
        process.with_contexts(|c| c.memory = Some(context));
        self.scheduler.with_lock(lock, |s, _| {
            s.processes.insert(Arc::clone(&process))?;
            s.set_kernel_process(id);
            process.set_published();
            Ok::<_, ProcessError>(())
        })?;
        info!("kernel process {id:?} initialized");
        Ok(id)
    }

    /// Start a thread of the kernel process.
    ///
    /// # Errors
    /// [`ProcessError::NotFound`] before [`Self::init_kernel_process`], or
    /// an allocation failure.
    pub fn create_kernel_thread(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        name: &str,
    ) -> Result<ThreadId, ProcessError> {
        let process = self
            .scheduler
            .with_lock(lock, |s, _| {
                s.kernel_process()
                    .and_then(|pid| s.processes.get(pid).cloned())
            })
            .ok_or(ProcessError::NotFound)?;
        let thread = self.allocate_thread(lock, name, &process)?;
        let id = thread.id();

        let inserted = self.scheduler.with_lock(lock, |s, _| {
            s.threads.insert(Arc::clone(&thread))?;
            s.add_ready(&thread);
            Ok::<_, ProcessError>(())
        });
        if let Err(e) = inserted {
            self.destroy_thread(lock, thread);
            return Err(e);
        }
        debug!("kernel thread {id:?} created");
        Ok(id)
    }

    /// Normal creation path: a new process with an empty address space,
    /// the given I/O and semaphore contexts and one ready thread.
    ///
    /// # Errors
    /// Any allocation failure; nothing is left behind.
    pub fn create_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        name: &str,
        io: Box<dyn IoContext>,
        semaphores: Box<dyn SemaphoreContext>,
    ) -> Result<(ProcessId, ThreadId), ProcessError> {
        let process = self.allocate_process(lock, name)?;
        let id = process.id();

        let context = match self.memory.create_context(lock, Some(id.as_u32())) {
            Ok(context) => context,
            Err(e) => {
                self.destroy_process(lock, process)?;
                return Err(e.into());
            }
        };
        process.with_contexts(|c| {
            c.memory = Some(context);
            c.io = Some(io);
            c.semaphores = Some(semaphores);
        });

        let thread = match self.allocate_thread(lock, name, &process) {
            Ok(thread) => thread,
            Err(e) => {
                self.destroy_process(lock, process)?;
                return Err(e);
            }
        };
        let tid = thread.id();
        if let Err(e) = self.publish(lock, &process, &thread) {
            self.destroy_thread(lock, thread);
            return Err(e);
        }

        self.notify(|l| l.process_created(id));
        Ok((id, tid))
    }

    /// Finish a thread. The first status recorded becomes the process's
    /// exit status; the last thread to exit takes the process down.
    ///
    /// # Errors
    /// [`ProcessError::NotFound`] for an unknown thread.
    pub fn exit_thread(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ThreadId,
        status: i32,
    ) -> Result<(), ProcessError> {
        let thread = self
            .get_thread_by_id(lock, id)
            .ok_or(ProcessError::NotFound)?;
        thread.set_state(ThreadState::Exited);
        thread.process().set_exit_status(status);
        debug!("thread {id:?} exited with {status}");
        self.destroy_thread(lock, thread);
        Ok(())
    }

    /// Block until process `id` has exited and collect its exit status.
    /// The identifier becomes free for reuse.
    ///
    /// # Errors
    /// [`ProcessError::NotFound`] if no such process is running and no
    /// uncollected exit status is left for it.
    pub fn wait_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
    ) -> Result<i32, ProcessError> {
        let process = match self.lookup_or_reap(lock, id)? {
            Lookup::Exited(status) => return Ok(status),
            Lookup::Running(process) => process,
        };
        let status = process.wait();
        self.scheduler.with_lock(lock, |s, _| s.processes.reap(id));
        Ok(status)
    }

    /// Collect the exit status of `id` if it has exited, without blocking.
    ///
    /// # Errors
    /// As [`Self::wait_process`].
    pub fn try_wait_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
    ) -> Result<Option<i32>, ProcessError> {
        match self.lookup_or_reap(lock, id)? {
            Lookup::Exited(status) => Ok(Some(status)),
            Lookup::Running(_) => Ok(None),
        }
    }

    fn lookup_or_reap(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
    ) -> Result<Lookup, ProcessError> {
        self.scheduler.with_lock(lock, |s, _| {
            if let Some(status) = s.processes.reap(id) {
                debug!("process {id:?} reaped with {status}");
                return Ok(Lookup::Exited(status));
            }
            s.processes
                .get(id)
                .cloned()
                .map(Lookup::Running)
                .ok_or(ProcessError::NotFound)
        })
    }

    /// Map a new region of `size` bytes at the first free address of the
    /// process. Its size counts towards the process's virtual memory, and
    /// towards its physical memory when the pages are allocated up front.
    ///
    /// # Errors
    /// [`ProcessError::NotFound`], [`ProcessError::InvalidArgument`] for a
    /// process without memory context, or the memory manager's failure.
    pub fn map_process_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
        name: &str,
        size: u64,
        flags: RegionFlags,
        method: AllocMethod,
    ) -> Result<RegionId, ProcessError> {
        let process = self
            .get_process_by_id(lock, id)
            .ok_or(ProcessError::NotFound)?;
        let context = process
            .memory_context()
            .ok_or(ProcessError::InvalidArgument)?;
        let region = self.memory.create_region(
            lock,
            context,
            name,
            None,
            size,
            flags,
            method,
            &self.scheduler,
            |s, region| {
                let usage = s.memory_usage_mut(id);
                usage.vmem = usage.vmem.saturating_add(region.size());
                usage.pmem = usage.pmem.saturating_add(region.committed_size());
            },
        )?;
        Ok(region)
    }

    /// Unmap a region of the process and account it.
    ///
    /// # Errors
    /// As [`Self::map_process_region`].
    pub fn unmap_process_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        id: ProcessId,
        region: RegionId,
    ) -> Result<(), ProcessError> {
        let process = self
            .get_process_by_id(lock, id)
            .ok_or(ProcessError::NotFound)?;
        let context = process
            .memory_context()
            .ok_or(ProcessError::InvalidArgument)?;
        self.memory
            .delete_region(lock, context, region, &self.scheduler, |s, removed| {
                let usage = s.memory_usage_mut(id);
                usage.vmem = usage.vmem.saturating_sub(removed.size());
                usage.pmem = usage.pmem.saturating_sub(removed.committed_size());
            })?;
        if process.heap_region() == Some(region) {
            process.set_heap_region(None);
        }
        Ok(())
    }
}

enum Lookup {
    Exited(i32),
    Running(Arc<Process>),
}
