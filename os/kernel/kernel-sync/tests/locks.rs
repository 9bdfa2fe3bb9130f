use kernel_sync::ordered::{LockCtx, OrderedMutex, RegionLevel, SchedulerLevel};
use kernel_sync::{Semaphore, SpinLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn spin_lock_try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.is_locked());

    // while held, try_lock must fail
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(!l.is_locked());
    assert!(l.try_lock().is_some());
}

#[test]
fn spin_lock_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn irq_guard_derefs_and_unlocks() {
    let m = SpinLock::new(vec![1, 2]);
    {
        let mut g = m.lock_irq();
        g.push(3);
        assert!(m.is_locked());
    }
    assert_eq!(m.lock().as_slice(), &[1, 2, 3]);
    assert!(m.try_lock().is_some());
}

fn hammer<F>(threads: usize, iters: usize, f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let start = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let f = Arc::clone(&f);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    f();
                    thread::yield_now();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn contended_spin_lock_is_exclusive() {
    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));

    let (l, c) = (Arc::clone(&lock), Arc::clone(&in_cs));
    hammer(8, 2_000, move || {
        l.with_lock(|v| {
            assert_eq!(c.fetch_add(1, Ordering::SeqCst), 0, "mutual exclusion violated");
            *v += 1;
            c.fetch_sub(1, Ordering::SeqCst);
        });
    });

    assert_eq!(lock.with_lock(|v| *v), 8 * 2_000);
}

#[test]
fn contended_ordered_locks_nest_without_deadlock() {
    struct Shared {
        regions: OrderedMutex<usize, RegionLevel>,
        sched: OrderedMutex<usize, SchedulerLevel>,
    }

    let shared = Arc::new(Shared {
        regions: OrderedMutex::new(0),
        sched: OrderedMutex::new(0),
    });

    let s = Arc::clone(&shared);
    hammer(4, 1_000, move || {
        let mut ctx = LockCtx::new();
        s.regions.with_lock(&mut ctx, |r, inner| {
            *r += 1;
            s.sched.with_lock(inner, |v, _| *v += 1);
        });
        // scheduler-only path from the root
        s.sched.with_lock(&mut ctx, |v, _| *v += 1);
    });

    let mut ctx = LockCtx::new();
    assert_eq!(*shared.regions.lock(&mut ctx), 4_000);
    assert_eq!(*shared.sched.lock(&mut ctx), 8_000);
}

#[test]
fn semaphore_wakes_waiter() {
    let sem = Arc::new(Semaphore::new(0));
    let waiter = {
        let sem = Arc::clone(&sem);
        thread::spawn(move || sem.acquire())
    };
    sem.release(1);
    waiter.join().unwrap();
    assert_eq!(sem.count(), 0);
}
