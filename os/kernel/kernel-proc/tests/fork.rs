mod common;

use common::{
    Census, Event, Faults, RecordingListener, TestKernel, census, kernel, kernel_with,
    small_config, spawn,
};
use kernel_info::errno::{EAGAIN, ENOENT, ENOMEM};
use kernel_proc::{ForkStep, ProcessId, ThreadId, ThreadState};
use kernel_sync::LockCtx;
use kernel_vmem::mock::ArchCall;
use kernel_vmem::{AllocMethod, MemoryContextId, RegionFlags};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn layout(kernel: &TestKernel, context: MemoryContextId) -> Vec<(u64, u64, RegionFlags)> {
    let mut lock = LockCtx::new();
    kernel.memory().inspect(&mut lock, |t| {
        t.regions_of(context)
            .unwrap()
            .map(|(_, r)| (r.start().as_u64(), r.size(), r.flags()))
            .collect()
    })
}

/// A parent with a heap and a stack region.
fn parent(kernel: &TestKernel, faults: &Arc<Faults>) -> (ProcessId, ThreadId) {
    let (pid, tid) = spawn(kernel, faults, "sh");
    let mut lock = LockCtx::new();
    let heap = kernel
        .map_process_region(
            &mut lock,
            pid,
            "heap",
            0x4000,
            RegionFlags::user_rw(),
            AllocMethod::Lazy,
        )
        .unwrap();
    kernel
        .map_process_region(
            &mut lock,
            pid,
            "stack",
            0x2000,
            RegionFlags::user_rw().with_stack(true),
            AllocMethod::Pages,
        )
        .unwrap();
    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();
    process.set_heap_region(Some(heap));
    (pid, tid)
}

fn only_thread_of(kernel: &TestKernel, pid: ProcessId) -> ThreadId {
    let mut lock = LockCtx::new();
    kernel.scheduler().with_lock(&mut lock, |s, _| {
        let mut threads = s.threads.iter().filter(|t| t.process().id() == pid);
        let thread = threads.next().unwrap().id();
        assert!(threads.next().is_none());
        thread
    })
}

#[test]
fn child_gets_a_copy_of_the_parent() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let listener = Arc::new(RecordingListener::default());
    kernel.add_listener(listener.clone());
    let (pid, tid) = parent(&kernel, &faults);
    let mut lock = LockCtx::new();
    let parent = kernel.get_process_by_id(&mut lock, pid).unwrap();
    parent.set_loader_data(Some(Arc::new(0xE1F_u32)));

    let child = kernel.fork(&mut lock, tid).unwrap();
    assert_ne!(child, pid);
    assert_eq!(kernel.process_count(&mut lock), 2);
    assert_eq!(kernel.thread_count(&mut lock), 2);

    let child_process = kernel.get_process_by_id(&mut lock, child).unwrap();
    assert!(child_process.with_name(|n| n == "sh"));
    assert_eq!(child_process.thread_count(), 1);

    let parent_ctx = parent.memory_context().unwrap();
    let child_ctx = child_process.memory_context().unwrap();
    assert_ne!(parent_ctx, child_ctx);
    assert_eq!(layout(&kernel, child_ctx), layout(&kernel, parent_ctx));
    assert_eq!(
        kernel.memory_usage(&mut lock, child),
        kernel.memory_usage(&mut lock, pid)
    );
    assert_eq!(kernel.memory_usage(&mut lock, child).vmem, 0x6000);
    assert_eq!(kernel.memory_usage(&mut lock, child).pmem, 0x2000);

    let parent_heap = parent.heap_region().unwrap();
    let child_heap = child_process.heap_region().unwrap();
    assert_ne!(parent_heap, child_heap);
    let heap_start = |id| {
        let mut lock = LockCtx::new();
        kernel.memory().with_region(&mut lock, id, |r| r.start()).unwrap()
    };
    assert_eq!(heap_start(parent_heap), heap_start(child_heap));

    let loader = child_process.loader_data().unwrap();
    assert_eq!(loader.downcast_ref::<u32>(), Some(&0xE1F));

    assert_eq!(faults.live_io.load(Ordering::SeqCst), 2);
    assert_eq!(faults.live_semaphores.load(Ordering::SeqCst), 2);

    let child_tid = only_thread_of(&kernel, child);
    let thread = kernel.get_thread_by_id(&mut lock, child_tid).unwrap();
    assert_eq!(thread.state(), ThreadState::Ready);
    let parent_top = kernel
        .get_thread_by_id(&mut lock, tid)
        .unwrap()
        .with_arch(|r| r.stack_top)
        .unwrap();
    let registers = thread.with_arch(|r| r.clone()).unwrap();
    assert_eq!(registers.syscall_return, Some(0));
    assert_eq!(registers.forked_from, Some(parent_top));

    assert_eq!(listener.events(), [Event::Created(pid), Event::Created(child)]);
}

#[test]
fn sys_fork_returns_child_pid() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (_, tid) = parent(&kernel, &faults);
    let mut lock = LockCtx::new();

    let ret = kernel.sys_fork(&mut lock, tid);
    assert!(ret > 0);
    let child = ProcessId::new(u32::try_from(ret).unwrap());
    assert!(kernel.get_process_by_id(&mut lock, child).is_some());
}

#[test]
fn forked_child_exits_independently() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let listener = Arc::new(RecordingListener::default());
    kernel.add_listener(listener.clone());
    let (pid, tid) = parent(&kernel, &faults);
    let before = census(&kernel, &faults);
    let mut lock = LockCtx::new();

    let child = kernel.fork(&mut lock, tid).unwrap();
    let child_process = kernel.get_process_by_id(&mut lock, child).unwrap();
    let child_tid = only_thread_of(&kernel, child);

    kernel.exit_thread(&mut lock, child_tid, 3).unwrap();
    assert_eq!(child_process.wait(), 3);
    assert!(kernel.get_process_by_id(&mut lock, child).is_none());
    assert_eq!(kernel.wait_process(&mut lock, child), Ok(3));
    assert_eq!(census(&kernel, &faults), before);
    assert_eq!(kernel.memory_usage(&mut lock, pid).vmem, 0x6000);
    assert_eq!(kernel.memory_usage(&mut lock, pid).pmem, 0x2000);
    assert_eq!(kernel.memory_usage(&mut lock, child).pmem, 0);
    assert_eq!(
        listener.events(),
        [Event::Created(pid), Event::Created(child), Event::Destroyed(child)]
    );
}

#[test]
fn fork_of_unknown_thread_fails() {
    let kernel = kernel();
    let mut lock = LockCtx::new();
    let err = kernel.fork(&mut lock, ThreadId::new(42)).unwrap_err();
    assert_eq!(err.step, ForkStep::Process);
    assert_eq!(kernel.sys_fork(&mut lock, ThreadId::new(42)), -ENOENT);
}

#[test]
fn full_process_table_fails_with_eagain() {
    let kernel = kernel_with(kernel_info::KernelConfig {
        max_processes: 2,
        ..small_config()
    });
    let faults = Arc::new(Faults::default());
    let (_, tid) = parent(&kernel, &faults);
    let before = census(&kernel, &faults);
    let mut lock = LockCtx::new();

    let err = kernel.fork(&mut lock, tid).unwrap_err();
    assert_eq!(err.step, ForkStep::Process);
    assert_eq!(err.errno(), EAGAIN);
    assert_eq!(kernel.sys_fork(&mut lock, tid), -EAGAIN);
    assert_eq!(census(&kernel, &faults), before);
}

type Inject = fn(&TestKernel, &Faults);

fn assert_failure_leaves_no_trace(step: ForkStep, inject: Inject) {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let listener = Arc::new(RecordingListener::default());
    kernel.add_listener(listener.clone());
    let (pid, tid) = parent(&kernel, &faults);
    let before: Census = census(&kernel, &faults);
    let usage = {
        let mut lock = LockCtx::new();
        kernel.memory_usage(&mut lock, pid)
    };
    let mut lock = LockCtx::new();

    inject(&kernel, &faults);
    let err = kernel.fork(&mut lock, tid).unwrap_err();
    assert_eq!(err.step, step, "{err}");
    assert!(err.errno() > 0);

    assert_eq!(census(&kernel, &faults), before, "after failure at {step:?}");
    assert_eq!(kernel.memory_usage(&mut lock, pid), usage);
    assert_eq!(listener.events(), [Event::Created(pid)]);

    // The failure was one-shot; the next attempt goes through.
    let child = kernel.fork(&mut lock, tid).unwrap();
    assert!(kernel.get_process_by_id(&mut lock, child).is_some());
}

#[test]
fn failure_while_creating_memory_context_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::MemoryContext, |k, _| {
        k.memory().arch().fail_after(ArchCall::Init, 0);
    });
}

#[test]
fn failure_while_sharing_kernel_mappings_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::MemoryContext, |k, _| {
        k.memory().arch().fail_after(ArchCall::CloneContext, 0);
    });
}

#[test]
fn failure_on_first_region_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::MemoryContext, |k, _| {
        k.memory().arch().fail_after(ArchCall::CloneRegion, 0);
    });
}

#[test]
fn failure_on_second_region_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::MemoryContext, |k, _| {
        k.memory().arch().fail_after(ArchCall::CloneRegion, 1);
    });
}

#[test]
fn failure_while_copying_io_context_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::IoContext, |_, f| {
        f.io.store(true, Ordering::SeqCst);
    });
}

#[test]
fn failure_while_copying_semaphores_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::SemaphoreContext, |_, f| {
        f.semaphores.store(true, Ordering::SeqCst);
    });
}

#[test]
fn failure_while_allocating_kernel_stack_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::Thread, |k, _| k.pages().fail_nth(0));
}

#[test]
fn failure_while_allocating_thread_state_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::Thread, |k, _| {
        k.arch().fail_allocate.store(true, Ordering::SeqCst);
    });
}

#[test]
fn failure_while_copying_registers_is_unwound() {
    assert_failure_leaves_no_trace(ForkStep::ArchFork, |k, _| {
        k.arch().fail_fork.store(true, Ordering::SeqCst);
    });
}

#[test]
fn failed_fork_reports_enomem_to_the_caller() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (_, tid) = parent(&kernel, &faults);
    let mut lock = LockCtx::new();

    faults.io.store(true, Ordering::SeqCst);
    assert_eq!(kernel.sys_fork(&mut lock, tid), -ENOMEM);
}
