//! # Paging Backend Interface
//!
//! The manager keeps the region bookkeeping; programming page tables is the
//! job of an [`ArchMemory`] implementation. Every call is made with the
//! region lock held, so an implementation sees a consistent region set.

use crate::region::{MemoryContextId, Region};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArchError {
    #[error("out of page-table memory")]
    OutOfMemory,
    #[error("mapping rejected by the paging backend")]
    Rejected,
}

pub trait ArchMemory {
    /// Hardware paging state of one context (e.g. the root table frame).
    type ContextData;

    /// Build the paging state of a fresh context.
    ///
    /// # Errors
    /// When the backing page-table memory cannot be allocated.
    fn init_memory_context(&self, id: MemoryContextId) -> Result<Self::ContextData, ArchError>;

    /// Copy the page-table structure shared by every context (kernel
    /// mappings) from `old` into `new`.
    ///
    /// # Errors
    /// When intermediate tables cannot be allocated.
    fn clone_memory_context(
        &self,
        old: &Self::ContextData,
        new: &mut Self::ContextData,
    ) -> Result<(), ArchError>;

    /// Reproduce the mappings of `old_region` for `new_region` in `new`.
    ///
    /// # Errors
    /// When pages or tables cannot be allocated. Nothing of `new_region`
    /// may remain mapped on error.
    fn clone_memory_region(
        &self,
        old: &Self::ContextData,
        old_region: &Region,
        new: &mut Self::ContextData,
        new_region: &Region,
    ) -> Result<(), ArchError>;

    /// Unmap and release the pages of `region`.
    fn delete_region_pages(&self, context: &mut Self::ContextData, region: &Region);

    /// Adjust the mapping of `region` to `new_size` bytes.
    ///
    /// # Errors
    /// When growing needs memory that is not available.
    fn resize_region_pages(
        &self,
        _context: &mut Self::ContextData,
        _region: &Region,
        _new_size: u64,
    ) -> Result<(), ArchError> {
        Ok(())
    }

    /// Release the paging state of a context whose regions are all gone.
    fn destroy_memory_context(&self, context: Self::ContextData);
}
