mod common;

use common::{Event, Faults, RecordingListener, census, kernel, kernel_with, small_config, spawn};
use kernel_info::KernelConfig;
use kernel_proc::{MemoryUsage, ProcessError, ThreadState};
use kernel_sync::LockCtx;
use kernel_vmem::mock::ArchCall;
use kernel_vmem::{AllocMethod, MemoryContextError, RegionFlags};
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[test]
fn created_process_is_ready_to_run() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let listener = Arc::new(RecordingListener::default());
    kernel.add_listener(listener.clone());

    let (pid, tid) = spawn(&kernel, &faults, "init");
    let mut lock = LockCtx::new();
    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();
    let thread = kernel.get_thread_by_id(&mut lock, tid).unwrap();

    assert_eq!(thread.process().id(), pid);
    assert_eq!(thread.state(), ThreadState::Ready);
    assert_eq!(thread.name(), "init");
    assert_eq!(process.thread_count(), 1);
    assert!(process.memory_context().is_some());
    assert_eq!(
        kernel.scheduler().with_lock(&mut lock, |s, _| s.next_ready()),
        Some(tid)
    );
    assert_eq!(kernel.pages().outstanding(), kernel.config().kernel_stack_pages);
    assert_eq!(listener.events(), [Event::Created(pid)]);
}

#[test]
fn last_thread_exit_destroys_the_process() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let listener = Arc::new(RecordingListener::default());
    kernel.add_listener(listener.clone());
    let empty = census(&kernel, &faults);

    let (pid, tid) = spawn(&kernel, &faults, "init");
    let mut lock = LockCtx::new();
    kernel
        .map_process_region(
            &mut lock,
            pid,
            "data",
            0x3000,
            RegionFlags::user_rw(),
            AllocMethod::Lazy,
        )
        .unwrap();
    assert_eq!(kernel.try_wait_process(&mut lock, pid), Ok(None));
    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();

    kernel.exit_thread(&mut lock, tid, 7).unwrap();
    assert_eq!(process.wait(), 7);
    assert_eq!(process.try_wait(), Some(7));
    assert_eq!(census(&kernel, &faults), empty);
    assert_eq!(kernel.memory_usage(&mut lock, pid), MemoryUsage::default());
    assert_eq!(kernel.try_wait_process(&mut lock, pid), Ok(Some(7)));
    assert_eq!(
        kernel.wait_process(&mut lock, pid),
        Err(ProcessError::NotFound)
    );
    assert_eq!(listener.events(), [Event::Created(pid), Event::Destroyed(pid)]);
    assert_eq!(
        kernel.exit_thread(&mut lock, tid, 0),
        Err(ProcessError::NotFound)
    );
}

#[test]
fn failed_creation_leaves_nothing_behind() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let empty = census(&kernel, &faults);
    let mut lock = LockCtx::new();

    kernel.memory().arch().fail_after(ArchCall::Init, 0);
    let err = kernel
        .create_process(
            &mut lock,
            "init",
            common::MockIo::boxed(&faults),
            common::MockSemaphores::boxed(&faults),
        )
        .unwrap_err();
    assert!(matches!(err, ProcessError::Memory(MemoryContextError::Arch(_))));
    assert_eq!(census(&kernel, &faults), empty);

    kernel.pages().fail_nth(0);
    let err = kernel
        .create_process(
            &mut lock,
            "init",
            common::MockIo::boxed(&faults),
            common::MockSemaphores::boxed(&faults),
        )
        .unwrap_err();
    assert_eq!(err, ProcessError::OutOfMemory);
    assert_eq!(census(&kernel, &faults), empty);
}

#[test]
fn kernel_process_outlives_its_threads() {
    let kernel = kernel();
    let mut lock = LockCtx::new();

    let pid = kernel.init_kernel_process(&mut lock, "kernel").unwrap();
    assert!(kernel.init_kernel_process(&mut lock, "kernel").is_err());
    let kernel_ctx = kernel.memory().kernel_context(&mut lock);
    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();
    assert_eq!(process.memory_context(), kernel_ctx);

    let worker = kernel.create_kernel_thread(&mut lock, "worker").unwrap();
    assert_eq!(process.thread_count(), 1);
    kernel.exit_thread(&mut lock, worker, 0).unwrap();

    assert_eq!(process.thread_count(), 0);
    assert!(kernel.get_process_by_id(&mut lock, pid).is_some());
    assert_eq!(process.try_wait(), None);
    assert_eq!(kernel.pages().outstanding(), 0);
    assert_eq!(kernel.arch().live.load(Ordering::SeqCst), 0);
}

#[test]
fn kernel_thread_needs_kernel_process() {
    let kernel = kernel();
    let mut lock = LockCtx::new();
    assert_eq!(
        kernel.create_kernel_thread(&mut lock, "worker"),
        Err(ProcessError::NotFound)
    );
}

#[test]
fn rename_and_enumerate() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (a, _) = spawn(&kernel, &faults, "a");
    let (b, _) = spawn(&kernel, &faults, "b");
    let mut lock = LockCtx::new();

    kernel.rename_process(&mut lock, b, "shell").unwrap();
    let mut seen = Vec::new();
    kernel.for_each_process(&mut lock, |p| seen.push((p.id(), p.with_name(str::to_owned))));
    assert_eq!(seen, [(a, "a".to_owned()), (b, "shell".to_owned())]);

    assert_eq!(
        kernel.rename_process(&mut lock, kernel_proc::ProcessId::new(99), "x"),
        Err(ProcessError::NotFound)
    );
}

#[test]
fn region_accounting_follows_map_and_unmap() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (pid, _) = spawn(&kernel, &faults, "init");
    let mut lock = LockCtx::new();

    let heap = kernel
        .map_process_region(
            &mut lock,
            pid,
            "heap",
            0x2000,
            RegionFlags::user_rw(),
            AllocMethod::Lazy,
        )
        .unwrap();
    let data = kernel
        .map_process_region(
            &mut lock,
            pid,
            "data",
            0x1000,
            RegionFlags::user_rw(),
            AllocMethod::Pages,
        )
        .unwrap();
    let usage = || {
        let u = kernel.memory_usage(&mut LockCtx::new(), pid);
        (u.vmem, u.pmem)
    };
    assert_eq!(usage(), (0x3000, 0x1000));

    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();
    process.set_heap_region(Some(heap));
    kernel.unmap_process_region(&mut lock, pid, heap).unwrap();
    assert_eq!(process.heap_region(), None);
    assert_eq!(usage(), (0x1000, 0x1000));

    assert!(kernel.unmap_process_region(&mut lock, pid, heap).is_err());
    assert_eq!(usage(), (0x1000, 0x1000));
    kernel.unmap_process_region(&mut lock, pid, data).unwrap();
    assert_eq!(usage(), (0, 0));
}

#[test]
fn destroying_a_live_process_is_refused() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (pid, _) = spawn(&kernel, &faults, "init");
    let mut lock = LockCtx::new();
    let process = kernel.get_process_by_id(&mut lock, pid).unwrap();

    assert_eq!(
        kernel.destroy_process(&mut lock, Arc::clone(&process)),
        Err(ProcessError::Busy)
    );

    let detached = kernel.allocate_process(&mut lock, "detached").unwrap();
    let thread = kernel.allocate_thread(&mut lock, "t", &detached).unwrap();
    assert_eq!(
        kernel.destroy_process(&mut lock, Arc::clone(&detached)),
        Err(ProcessError::Busy)
    );
    kernel.destroy_thread(&mut lock, thread);
    assert_eq!(detached.thread_count(), 0);
    assert_eq!(detached.try_wait(), Some(0));
}

#[test]
fn removed_process_can_be_destroyed() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let mut lock = LockCtx::new();
    let process = kernel.allocate_process(&mut lock, "orphan").unwrap();
    kernel.insert_process(&mut lock, &process).unwrap();
    assert_eq!(
        kernel.insert_process(&mut lock, &process),
        Err(ProcessError::Busy)
    );

    let removed = kernel.remove_process(&mut lock, process.id()).unwrap();
    assert!(Arc::ptr_eq(&removed, &process));
    drop(removed);
    kernel.destroy_process(&mut lock, process).unwrap();
    assert_eq!(census(&kernel, &faults).processes, 0);
}

#[test]
fn exit_status_is_collected_once_through_the_pid() {
    let kernel = kernel();
    let faults = Arc::new(Faults::default());
    let (pid, tid) = spawn(&kernel, &faults, "job");
    let mut lock = LockCtx::new();

    kernel.exit_thread(&mut lock, tid, 9).unwrap();
    assert!(kernel.get_process_by_id(&mut lock, pid).is_none());
    assert_eq!(kernel.wait_process(&mut lock, pid), Ok(9));
    assert_eq!(
        kernel.try_wait_process(&mut lock, pid),
        Err(ProcessError::NotFound)
    );
}

#[test]
fn exited_pid_is_held_until_reaped() {
    let kernel = kernel_with(KernelConfig {
        max_processes: 2,
        ..small_config()
    });
    let faults = Arc::new(Faults::default());
    let (pid, tid) = spawn(&kernel, &faults, "job");
    let mut lock = LockCtx::new();
    kernel.exit_thread(&mut lock, tid, 1).unwrap();

    assert_eq!(
        kernel.allocate_process(&mut lock, "next").unwrap_err(),
        ProcessError::TableFull
    );
    assert_eq!(kernel.try_wait_process(&mut lock, pid), Ok(Some(1)));
    let (next, _) = spawn(&kernel, &faults, "next");
    assert_eq!(next, pid);
}

#[test]
fn pending_process_does_not_share_a_pid_with_a_live_one() {
    let kernel = kernel_with(KernelConfig {
        max_processes: 3,
        ..small_config()
    });
    let faults = Arc::new(Faults::default());
    let mut lock = LockCtx::new();

    let pending = kernel.allocate_process(&mut lock, "pending").unwrap();
    let (live, _) = spawn(&kernel, &faults, "live");
    assert_ne!(pending.id(), live);
    kernel
        .map_process_region(
            &mut lock,
            live,
            "data",
            0x3000,
            RegionFlags::user_rw(),
            AllocMethod::Pages,
        )
        .unwrap();

    kernel.destroy_process(&mut lock, pending).unwrap();
    assert_eq!(
        kernel.memory_usage(&mut lock, live),
        MemoryUsage {
            vmem: 0x3000,
            pmem: 0x3000
        }
    );
    assert!(kernel.get_process_by_id(&mut lock, live).is_some());
}
