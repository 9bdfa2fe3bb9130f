#![allow(dead_code)]

use kernel_alloc::HostPageAlloc;
use kernel_info::{AddressLayout, KernelConfig};
use kernel_proc::{
    ArchThread, IoContext, Kernel, KernelStack, ProcessError, ProcessId, ProcessListener,
    SemaphoreContext, ThreadId,
};
use kernel_sync::LockCtx;
use kernel_vmem::mock::MockArch;
use kernel_vmem::MemoryManager;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type TestKernel = Kernel<MockArch, MockThreadArch, HostPageAlloc>;

/// Failure switches and live counters shared by the mock contexts.
#[derive(Default)]
pub struct Faults {
    pub io: AtomicBool,
    pub semaphores: AtomicBool,
    pub live_io: AtomicUsize,
    pub live_semaphores: AtomicUsize,
}

pub struct MockIo(Arc<Faults>);

impl MockIo {
    pub fn boxed(faults: &Arc<Faults>) -> Box<dyn IoContext> {
        faults.live_io.fetch_add(1, Ordering::SeqCst);
        Box::new(Self(Arc::clone(faults)))
    }
}

impl IoContext for MockIo {
    fn try_clone(&self) -> Result<Box<dyn IoContext>, ProcessError> {
        if self.0.io.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::OutOfMemory);
        }
        Ok(Self::boxed(&self.0))
    }
}

impl Drop for MockIo {
    fn drop(&mut self) {
        self.0.live_io.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockSemaphores(Arc<Faults>);

impl MockSemaphores {
    pub fn boxed(faults: &Arc<Faults>) -> Box<dyn SemaphoreContext> {
        faults.live_semaphores.fetch_add(1, Ordering::SeqCst);
        Box::new(Self(Arc::clone(faults)))
    }
}

impl SemaphoreContext for MockSemaphores {
    fn try_clone(&self) -> Result<Box<dyn SemaphoreContext>, ProcessError> {
        if self.0.semaphores.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::OutOfMemory);
        }
        Ok(Self::boxed(&self.0))
    }
}

impl Drop for MockSemaphores {
    fn drop(&mut self) {
        self.0.live_semaphores.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Saved state of a mock thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    pub stack_top: usize,
    /// Value the thread sees returned from the system call it resumes in.
    pub syscall_return: Option<u64>,
    /// Stack top of the thread this one was forked from.
    pub forked_from: Option<usize>,
}

#[derive(Default)]
pub struct MockThreadArch {
    pub fail_allocate: AtomicBool,
    pub fail_fork: AtomicBool,
    pub live: AtomicUsize,
}

impl ArchThread for MockThreadArch {
    type ThreadData = Registers;

    fn allocate_thread(&self, stack: &KernelStack) -> Result<Registers, ProcessError> {
        if self.fail_allocate.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::OutOfMemory);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Registers {
            stack_top: stack.top(),
            syscall_return: None,
            forked_from: None,
        })
    }

    fn do_fork(
        &self,
        parent: &Registers,
        child: &mut Registers,
        child_stack: &KernelStack,
    ) -> Result<(), ProcessError> {
        if self.fail_fork.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::OutOfMemory);
        }
        assert_eq!(child.stack_top, child_stack.top());
        child.syscall_return = Some(0);
        child.forked_from = Some(parent.stack_top);
        Ok(())
    }

    fn destroy_thread(&self, data: Registers) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        drop(data);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    Created(ProcessId),
    Destroyed(ProcessId),
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl ProcessListener for RecordingListener {
    fn process_created(&self, pid: ProcessId) {
        self.events.lock().unwrap().push(Event::Created(pid));
    }

    fn process_destroyed(&self, pid: ProcessId) {
        self.events.lock().unwrap().push(Event::Destroyed(pid));
    }
}

pub fn small_config() -> KernelConfig {
    KernelConfig {
        max_processes: 64,
        max_threads: 64,
        kernel_stack_pages: 2,
    }
}

pub fn kernel_with(config: KernelConfig) -> TestKernel {
    Kernel::new(
        config,
        MemoryManager::new(MockArch::new(), AddressLayout::default()),
        MockThreadArch::default(),
        HostPageAlloc::new(),
    )
}

pub fn kernel() -> TestKernel {
    kernel_with(small_config())
}

/// A user process with a fresh I/O and semaphore context.
pub fn spawn(kernel: &TestKernel, faults: &Arc<Faults>, name: &str) -> (ProcessId, ThreadId) {
    let mut lock = LockCtx::new();
    kernel
        .create_process(
            &mut lock,
            name,
            MockIo::boxed(faults),
            MockSemaphores::boxed(faults),
        )
        .unwrap()
}

/// Counters that must come back to their previous values after a failed
/// operation.
#[derive(Debug, PartialEq, Eq)]
pub struct Census {
    pub processes: usize,
    pub threads: usize,
    pub memory_contexts: usize,
    pub arch_contexts: usize,
    pub arch_threads: usize,
    pub stack_pages: usize,
    pub io: usize,
    pub semaphores: usize,
}

pub fn census(kernel: &TestKernel, faults: &Faults) -> Census {
    let mut lock = LockCtx::new();
    Census {
        processes: kernel.process_count(&mut lock),
        threads: kernel.thread_count(&mut lock),
        memory_contexts: kernel.memory().inspect(&mut lock, |t| t.context_count()),
        arch_contexts: kernel.memory().arch().live_contexts(),
        arch_threads: kernel.arch().live.load(Ordering::SeqCst),
        stack_pages: kernel.pages().outstanding(),
        io: faults.live_io.load(Ordering::SeqCst),
        semaphores: faults.live_semaphores.load(Ordering::SeqCst),
    }
}
