use kernel_info::errno::{EAGAIN, EBUSY, EINVAL, ENOENT, ENOMEM};
use kernel_vmem::MemoryContextError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProcessError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such process or thread")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("identifier space exhausted")]
    TableFull,
    #[error("identifier or resource still in use")]
    Busy,
    #[error("memory context: {0}")]
    Memory(#[from] MemoryContextError),
}

impl ProcessError {
    /// Positive error number for the system call boundary.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::NotFound => ENOENT,
            Self::InvalidArgument => EINVAL,
            Self::TableFull => EAGAIN,
            Self::Busy => EBUSY,
            Self::Memory(e) => e.errno(),
        }
    }
}

/// The resource a fork was acquiring when it failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForkStep {
    Process,
    MemoryContext,
    IoContext,
    SemaphoreContext,
    Thread,
    ArchFork,
    Publish,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("fork failed at {step:?}: {source}")]
pub struct ForkError {
    pub step: ForkStep,
    #[source]
    pub source: ProcessError,
}

impl ForkError {
    pub(crate) fn at(step: ForkStep) -> impl FnOnce(ProcessError) -> Self {
        move |source| Self { step, source }
    }

    #[must_use]
    pub const fn errno(self) -> i32 {
        self.source.errno()
    }
}
