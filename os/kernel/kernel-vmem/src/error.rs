use crate::arch::ArchError;
use kernel_info::errno::{EBUSY, EINVAL, ENOENT, ENOMEM};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryContextError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no unmapped range of the requested size")]
    NotFound,
    #[error("region overlaps an existing mapping")]
    Overlap,
    #[error("unknown memory context")]
    UnknownContext,
    #[error("memory context has been torn down")]
    TornDown,
    #[error("operation not permitted on the kernel memory context")]
    KernelContext,
    #[error("kernel memory context already exists")]
    KernelContextExists,
    #[error("paging backend failed: {0}")]
    Arch(#[from] ArchError),
}

impl MemoryContextError {
    /// Positive error number for the system call boundary.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory | Self::Arch(ArchError::OutOfMemory) => ENOMEM,
            Self::NotFound => ENOENT,
            Self::KernelContextExists => EBUSY,
            Self::InvalidArgument
            | Self::Overlap
            | Self::UnknownContext
            | Self::TornDown
            | Self::KernelContext
            | Self::Arch(_) => EINVAL,
        }
    }
}
