//! # Processes and Threads
//!
//! Process and thread tables, the lifetime rules tying threads to their
//! process, and process duplication ([`Kernel::fork`]).
//!
//! ```text
//!                      Kernel<M, T, P>
//!  ┌──────────────────────────────────────────────────────┐
//!  │ MemoryManager<M>        region lock                  │
//!  │        │ nests                                       │
//!  │        ▼                                             │
//!  │ Scheduler               scheduler lock               │
//!  │   processes: pid ─► Arc<Process> ◄──┐                │
//!  │   threads:   tid ─► Arc<Thread> ────┘ thread_count   │
//!  │   ready queue, memory usage per pid                  │
//!  │                                                      │
//!  │ T: ArchThread   P: PageAlloc (kernel stacks)         │
//!  └──────────────────────────────────────────────────────┘
//! ```
//!
//! A process lives as long as it has threads. Destroying its last thread
//! removes it from the table, tears down its contexts and releases whoever
//! waits for it. The kernel process is the exception and is never torn
//! down.
//!
//! ## Lock order
//!
//! The region lock is taken before the scheduler lock, never the other way
//! around. Both are [`OrderedMutex`](kernel_sync::OrderedMutex)es, so the
//! reverse order does not compile.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
mod fork;
mod id;
mod interfaces;
mod kernel;
mod process;
mod scheduler;
mod thread;

pub use error::{ForkError, ForkStep, ProcessError};
pub use id::{IdAllocator, ProcessId, ThreadId};
pub use interfaces::{ArchThread, IoContext, ProcessListener, SemaphoreContext};
pub use kernel::{Kernel, Scheduler};
pub use process::{MemoryUsage, Process, ProcessContexts};
pub use scheduler::{ProcessTable, SchedulerState, ThreadTable};
pub use thread::{KernelStack, Thread, ThreadState};
