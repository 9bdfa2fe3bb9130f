//! # Collaborator Interfaces
//!
//! Subsystems the process core drives without knowing their internals:
//! per-process I/O and semaphore state, the architecture's thread setup
//! and anyone interested in process lifetime.

use crate::error::ProcessError;
use crate::id::ProcessId;
use crate::thread::KernelStack;
use alloc::boxed::Box;

/// Open files and working directory of a process.
pub trait IoContext: Send {
    /// Copy for a forked child; open files are shared, not reopened.
    ///
    /// # Errors
    /// [`ProcessError::OutOfMemory`] if the copy cannot be allocated.
    fn try_clone(&self) -> Result<Box<dyn IoContext>, ProcessError>;
}

/// Named and anonymous semaphores of a process.
pub trait SemaphoreContext: Send {
    /// Copy for a forked child.
    ///
    /// # Errors
    /// [`ProcessError::OutOfMemory`] if the copy cannot be allocated.
    fn try_clone(&self) -> Result<Box<dyn SemaphoreContext>, ProcessError>;
}

/// Register and stack setup of threads.
pub trait ArchThread {
    /// Saved register state of one thread.
    type ThreadData: Send;

    /// Prepare the register state of a thread running on `stack`.
    ///
    /// # Errors
    /// When the architecture state cannot be allocated.
    fn allocate_thread(&self, stack: &KernelStack) -> Result<Self::ThreadData, ProcessError>;

    /// Make `child` resume from the same system call as `parent`, with a
    /// return value of 0.
    ///
    /// # Errors
    /// When the parent's state cannot be copied onto the child's stack.
    fn do_fork(
        &self,
        parent: &Self::ThreadData,
        child: &mut Self::ThreadData,
        child_stack: &KernelStack,
    ) -> Result<(), ProcessError>;

    /// Release the register state of a destroyed thread.
    fn destroy_thread(&self, data: Self::ThreadData) {
        drop(data);
    }
}

/// Observer of process creation and destruction.
///
/// Called after the kernel has released its locks; implementations must
/// not block.
pub trait ProcessListener: Send + Sync {
    fn process_created(&self, _pid: ProcessId) {}
    fn process_destroyed(&self, _pid: ProcessId) {}
}
