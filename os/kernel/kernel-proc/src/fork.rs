//! # Fork
//!
//! The child is assembled from five resources, acquired in this order:
//!
//! ```text
//! process ─► memory context ─► I/O context ─► semaphore context ─► thread ─► register copy ─► tables
//! └───────── unwind: destroy_process ─────────────────────────────┘ └── unwind: destroy_thread ──┘
//! ```
//!
//! Until the thread exists, a failure tears down the process, which owns
//! whatever contexts were filled in. Once the thread exists, cleanup goes
//! through [`Kernel::destroy_thread`], which takes the process with it when
//! its last thread is gone. Either way the process and thread tables are
//! left as they were.

use crate::error::{ForkError, ForkStep, ProcessError};
use crate::id::{ProcessId, ThreadId};
use crate::interfaces::{ArchThread, IoContext, SemaphoreContext};
use crate::kernel::Kernel;
use crate::process::{Process, try_copy_str};
use crate::thread::Thread;
use alloc::sync::Arc;
use kernel_alloc::PageAlloc;
use kernel_sync::LockCtx;
use kernel_sync::ordered::Unlocked;
use kernel_vmem::{ArchMemory, Region};
use log::{debug, info, warn};

impl<M: ArchMemory, T: ArchThread, P: PageAlloc> Kernel<M, T, P> {
    /// Duplicate the process of thread `current`.
    ///
    /// The child gets a copy of the parent's address space (without kernel
    /// regions), copies of its I/O and semaphore contexts and one ready
    /// thread that resumes from the same system call with a return value
    /// of 0. Returns the child's identifier.
    ///
    /// # Errors
    /// A [`ForkError`] naming the step that failed. Everything acquired up
    /// to that step has been released again.
    pub fn fork(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        current: ThreadId,
    ) -> Result<ProcessId, ForkError> {
        let parent_thread = self
            .get_thread_by_id(lock, current)
            .ok_or(ProcessError::NotFound)
            .map_err(ForkError::at(ForkStep::Process))?;
        let parent = Arc::clone(parent_thread.process());
        let parent_id = parent.id();

        let name = parent
            .with_name(try_copy_str)
            .map_err(ForkError::at(ForkStep::Process))?;
        let child = self
            .allocate_process(lock, &name)
            .map_err(ForkError::at(ForkStep::Process))?;
        let child_id = child.id();
        debug!("fork {parent_id:?} -> {child_id:?}");

        let cloned = parent
            .memory_context()
            .ok_or(ProcessError::InvalidArgument)
            .and_then(|context| {
                self.memory()
                    .clone_context(
                        lock,
                        context,
                        Some(child_id.as_u32()),
                        self.scheduler(),
                        |s| {
                            let usage = s.memory_usage(parent_id);
                            *s.memory_usage_mut(child_id) = usage;
                        },
                    )
                    .map_err(ProcessError::from)
            });
        match cloned {
            Ok(context) => child.with_contexts(|c| c.memory = Some(context)),
            Err(e) => return Err(self.unwind_process(lock, child, ForkStep::MemoryContext, e)),
        }
        self.inherit_heap_region(lock, &parent, &child);
        child.set_loader_data(parent.loader_data());

        let io = parent.with_contexts(|c| c.io.as_deref().map(IoContext::try_clone).transpose());
        match io {
            Ok(io) => child.with_contexts(|c| c.io = io),
            Err(e) => return Err(self.unwind_process(lock, child, ForkStep::IoContext, e)),
        }

        let semaphores = parent.with_contexts(|c| {
            c.semaphores
                .as_deref()
                .map(SemaphoreContext::try_clone)
                .transpose()
        });
        match semaphores {
            Ok(semaphores) => child.with_contexts(|c| c.semaphores = semaphores),
            Err(e) => return Err(self.unwind_process(lock, child, ForkStep::SemaphoreContext, e)),
        }

        let thread = match self.allocate_thread(lock, parent_thread.name(), &child) {
            Ok(thread) => thread,
            Err(e) => return Err(self.unwind_process(lock, child, ForkStep::Thread, e)),
        };

        if let Err(e) = self.copy_registers(&parent_thread, &thread) {
            return Err(self.unwind_thread(lock, thread, ForkStep::ArchFork, e));
        }

        if let Err(e) = self.publish(lock, &child, &thread) {
            return Err(self.unwind_thread(lock, thread, ForkStep::Publish, e));
        }

        info!("forked {parent_id:?} into {child_id:?}");
        self.notify(|l| l.process_created(child_id));
        Ok(child_id)
    }

    /// [`Self::fork`] for the system call layer: the child's identifier, or
    /// a negative error number.
    pub fn sys_fork(&self, lock: &mut LockCtx<'_, Unlocked>, current: ThreadId) -> i32 {
        match self.fork(lock, current) {
            Ok(child) => i32::try_from(child.as_u32()).unwrap_or(i32::MAX),
            Err(e) => -e.errno(),
        }
    }

    fn copy_registers(
        &self,
        parent: &Thread<T::ThreadData>,
        child: &Thread<T::ThreadData>,
    ) -> Result<(), ProcessError> {
        let parent_arch = parent.arch.lock();
        let mut child_arch = child.arch.lock();
        let stack = child.stack.lock();
        match (parent_arch.as_ref(), child_arch.as_mut(), stack.as_ref()) {
            (Some(from), Some(to), Some(stack)) => self.arch().do_fork(from, to, stack),
            _ => Err(ProcessError::InvalidArgument),
        }
    }

    /// Point the child's heap region at the copy of the parent's.
    fn inherit_heap_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        parent: &Process,
        child: &Process,
    ) {
        let (Some(heap), Some(context)) = (parent.heap_region(), child.memory_context()) else {
            return;
        };
        let copy = self
            .memory()
            .with_region(lock, heap, Region::start)
            .and_then(|start| self.memory().region_at(lock, context, start));
        child.set_heap_region(copy.ok().flatten());
    }

    fn unwind_process(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        child: Arc<Process>,
        step: ForkStep,
        source: ProcessError,
    ) -> ForkError {
        warn!("fork into {:?} failed at {step:?}: {source}", child.id());
        if let Err(e) = self.destroy_process(lock, child) {
            warn!("fork unwind: {e}");
        }
        ForkError { step, source }
    }

    fn unwind_thread(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        thread: Arc<Thread<T::ThreadData>>,
        step: ForkStep,
        source: ProcessError,
    ) -> ForkError {
        warn!(
            "fork into {:?} failed at {step:?}: {source}",
            thread.process().id()
        );
        self.destroy_thread(lock, thread);
        ForkError { step, source }
    }
}
