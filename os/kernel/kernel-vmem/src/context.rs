//! # Memory Contexts
//!
//! A context is the ordered set of regions forming one address space plus
//! the paging backend's state for it. All contexts and all regions live in
//! one [`RegionTable`], which the manager keeps behind the region lock.
//!
//! ```text
//! Uninitialized ──► Initialized ──► Populated ──► TornDown
//!                        └────────────────────────────▲
//! ```

use crate::addresses::VirtualAddress;
use crate::error::MemoryContextError;
use crate::region::{MemoryContextId, Region, RegionId};
use crate::slab::Slab;
use alloc::vec::Vec;
use kernel_info::AddressLayout;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    /// Registered, paging state not built yet.
    Uninitialized,
    /// Paging state built, no region inserted yet.
    Initialized,
    /// At least one region was inserted.
    Populated,
    /// Regions deleted at exit; no further mutation is accepted.
    TornDown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextKind {
    /// The kernel's own address space.
    Kernel,
    /// A process address space.
    User,
}

pub struct MemoryContext<D> {
    kind: ContextKind,
    state: ContextState,
    /// Owning process, by id.
    owner: Option<u32>,
    /// Sorted by start address; extents are pairwise disjoint.
    regions: Vec<RegionId>,
    arch: Option<D>,
}

impl<D> MemoryContext<D> {
    pub(crate) const fn new(kind: ContextKind, owner: Option<u32>) -> Self {
        Self {
            kind,
            state: ContextState::Uninitialized,
            owner,
            regions: Vec::new(),
            arch: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    #[must_use]
    pub const fn state(&self) -> ContextState {
        self.state
    }

    #[must_use]
    pub const fn owner(&self) -> Option<u32> {
        self.owner
    }

    /// Region ids in ascending address order.
    #[must_use]
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    #[must_use]
    pub const fn arch(&self) -> Option<&D> {
        self.arch.as_ref()
    }

    pub(crate) fn set_arch(&mut self, data: D) {
        self.arch = Some(data);
        self.state = ContextState::Initialized;
    }

    pub(crate) const fn arch_mut(&mut self) -> Option<&mut D> {
        self.arch.as_mut()
    }

    pub(crate) const fn take_arch(&mut self) -> Option<D> {
        self.arch.take()
    }

    pub(crate) const fn set_state(&mut self, state: ContextState) {
        self.state = state;
    }

    pub(crate) const fn regions_mut(&mut self) -> &mut Vec<RegionId> {
        &mut self.regions
    }

    fn ensure_mutable(&self) -> Result<(), MemoryContextError> {
        match self.state {
            ContextState::Initialized | ContextState::Populated => Ok(()),
            ContextState::TornDown => Err(MemoryContextError::TornDown),
            ContextState::Uninitialized => Err(MemoryContextError::InvalidArgument),
        }
    }
}

/// Every context and every region, guarded as one unit by the region lock.
pub struct RegionTable<D> {
    pub(crate) contexts: Slab<MemoryContext<D>>,
    pub(crate) regions: Slab<Region>,
    pub(crate) kernel: Option<MemoryContextId>,
}

impl<D> Default for RegionTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> RegionTable<D> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            contexts: Slab::new(),
            regions: Slab::new(),
            kernel: None,
        }
    }

    /// # Errors
    /// [`MemoryContextError::UnknownContext`] for a stale or foreign id.
    pub fn context(&self, id: MemoryContextId) -> Result<&MemoryContext<D>, MemoryContextError> {
        self.contexts
            .get(id.0)
            .ok_or(MemoryContextError::UnknownContext)
    }

    pub(crate) fn context_mut(
        &mut self,
        id: MemoryContextId,
    ) -> Result<&mut MemoryContext<D>, MemoryContextError> {
        self.contexts
            .get_mut(id.0)
            .ok_or(MemoryContextError::UnknownContext)
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.0)
    }

    #[must_use]
    pub const fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Number of entries in the global region-id table.
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Regions of a context in address order.
    pub fn regions_of(
        &self,
        id: MemoryContextId,
    ) -> Result<impl Iterator<Item = (RegionId, &Region)>, MemoryContextError> {
        let context = self.context(id)?;
        Ok(context
            .regions
            .iter()
            .filter_map(|rid| self.regions.get(rid.0).map(|r| (*rid, r))))
    }

    /// Link `region` into `context`, keeping the sequence ordered by start.
    ///
    /// # Errors
    /// - [`MemoryContextError::InvalidArgument`] if the region lies outside
    ///   the half of the address space its `kernel` flag selects.
    /// - [`MemoryContextError::Overlap`] if it intersects an existing region.
    /// - [`MemoryContextError::OutOfMemory`] if the tables cannot grow.
    pub(crate) fn insert(
        &mut self,
        context: MemoryContextId,
        mut region: Region,
        layout: &AddressLayout,
    ) -> Result<RegionId, MemoryContextError> {
        let (first, last) = layout.bounds(region.is_kernel());
        if region.start().as_u64() < first || region.last().as_u64() > last {
            return Err(MemoryContextError::InvalidArgument);
        }

        let Self {
            contexts, regions, ..
        } = self;
        let ctx = contexts
            .get_mut(context.0)
            .ok_or(MemoryContextError::UnknownContext)?;
        ctx.ensure_mutable()?;

        let start = region.start();
        let index = ctx
            .regions
            .partition_point(|rid| regions.get(rid.0).is_some_and(|r| r.start() <= start));

        let overlaps = |i: usize| {
            ctx.regions
                .get(i)
                .and_then(|rid| regions.get(rid.0))
                .is_some_and(|r| r.overlaps(&region))
        };
        if (index > 0 && overlaps(index - 1)) || overlaps(index) {
            return Err(MemoryContextError::Overlap);
        }

        ctx.regions
            .try_reserve(1)
            .map_err(|_| MemoryContextError::OutOfMemory)?;
        region.set_context(Some(context));
        let id = RegionId(
            regions
                .insert(region)
                .map_err(|_| MemoryContextError::OutOfMemory)?,
        );
        ctx.regions.insert(index, id);
        ctx.state = ContextState::Populated;
        Ok(id)
    }

    /// Unlink `region` from `context` and drop it from the region-id table.
    ///
    /// # Errors
    /// [`MemoryContextError::InvalidArgument`] if the region is not part of
    /// the context.
    pub(crate) fn remove(
        &mut self,
        context: MemoryContextId,
        region: RegionId,
    ) -> Result<Region, MemoryContextError> {
        let ctx = self
            .contexts
            .get_mut(context.0)
            .ok_or(MemoryContextError::UnknownContext)?;
        let index = ctx
            .regions
            .iter()
            .position(|r| *r == region)
            .ok_or(MemoryContextError::InvalidArgument)?;
        ctx.regions.remove(index);
        let mut removed = self
            .regions
            .remove(region.0)
            .ok_or(MemoryContextError::InvalidArgument)?;
        removed.set_context(None);
        Ok(removed)
    }

    /// First-fit search for `size` free bytes in `[first, last]`.
    pub(crate) fn find_gap(
        &self,
        context: MemoryContextId,
        first: u64,
        last: u64,
        size: u64,
    ) -> Result<VirtualAddress, MemoryContextError> {
        if size == 0 {
            return Err(MemoryContextError::InvalidArgument);
        }
        let extents = self
            .regions_of(context)?
            .map(|(_, r)| (r.start().as_u64(), r.last().as_u64()));
        first_fit(extents, first, last, size)
            .map(VirtualAddress::new)
            .ok_or(MemoryContextError::NotFound)
    }

    /// Whether `region` can grow or shrink to `new_size` in place.
    pub(crate) fn can_resize(
        &self,
        context: MemoryContextId,
        region: RegionId,
        new_size: u64,
        layout: &AddressLayout,
    ) -> bool {
        let Ok(ctx) = self.context(context) else {
            return false;
        };
        let Some(index) = ctx.regions.iter().position(|r| *r == region) else {
            return false;
        };
        let Some(current) = self.regions.get(region.0) else {
            return false;
        };
        let Some(new_last) = current.start().last_of(new_size) else {
            return false;
        };

        match ctx.regions.get(index + 1).and_then(|n| self.regions.get(n.0)) {
            Some(next) => new_last < next.start(),
            None => {
                let (_, ceiling) = layout.bounds(current.is_kernel());
                new_last.as_u64() <= ceiling
            }
        }
    }

    /// The region of `context` covering `address`.
    pub(crate) fn region_at(
        &self,
        context: MemoryContextId,
        address: VirtualAddress,
    ) -> Result<Option<RegionId>, MemoryContextError> {
        let ctx = self.context(context)?;
        let index = ctx
            .regions
            .partition_point(|rid| self.regions.get(rid.0).is_some_and(|r| r.start() <= address));
        Ok(index
            .checked_sub(1)
            .map(|i| ctx.regions[i])
            .filter(|rid| self.regions.get(rid.0).is_some_and(|r| r.contains(address))))
    }
}

/// First fit over disjoint inclusive extents sorted by start.
///
/// Returns the lowest address `a >= first` such that `[a, a + size - 1]`
/// lies within `[first, last]` and intersects no extent.
pub(crate) fn first_fit(
    extents: impl Iterator<Item = (u64, u64)>,
    first: u64,
    last: u64,
    size: u64,
) -> Option<u64> {
    debug_assert!(size > 0);
    if first > last {
        return None;
    }
    let mut cursor = first;
    for (r_first, r_last) in extents {
        if r_last < cursor {
            continue;
        }
        if r_first > last {
            break;
        }
        if r_first > cursor {
            let gap_last = (r_first - 1).min(last);
            if gap_last - cursor >= size - 1 {
                return Some(cursor);
            }
        }
        cursor = r_last.checked_add(1)?;
        if cursor > last {
            return None;
        }
    }
    (last - cursor >= size - 1).then_some(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_picks_earliest_gap() {
        let extents = [(0x1000, 0x1fff), (0x4000, 0x4fff)];
        assert_eq!(first_fit(extents.into_iter(), 0x1000, 0xffff, 0x1000), Some(0x2000));
        assert_eq!(first_fit(extents.into_iter(), 0x1000, 0xffff, 0x2000), Some(0x2000));
        assert_eq!(first_fit(extents.into_iter(), 0x1000, 0xffff, 0x2001), Some(0x5000));
    }

    #[test]
    fn first_fit_respects_window() {
        let extents = [(0x1000, 0x1fff), (0x4000, 0x4fff)];
        // gap before the first region
        assert_eq!(first_fit(extents.into_iter(), 0x0, 0xffff, 0x1000), Some(0x0));
        // window ends inside the second gap
        assert_eq!(first_fit(extents.into_iter(), 0x1000, 0x2fff, 0x1000), Some(0x2000));
        assert_eq!(first_fit(extents.into_iter(), 0x1000, 0x2ffe, 0x1000), None);
        // window starts inside a region
        assert_eq!(first_fit(extents.into_iter(), 0x4800, 0xffff, 0x1000), Some(0x5000));
    }

    #[test]
    fn first_fit_empty_and_top_of_address_space() {
        assert_eq!(first_fit(core::iter::empty(), 0x1000, 0x1fff, 0x1000), Some(0x1000));
        assert_eq!(first_fit(core::iter::empty(), 0x1000, 0x1fff, 0x1001), None);

        let top = [(u64::MAX - 0xfff, u64::MAX)];
        assert_eq!(first_fit(top.into_iter(), u64::MAX - 0x1fff, u64::MAX, 0x1000), Some(u64::MAX - 0x1fff));
        assert_eq!(first_fit(top.into_iter(), u64::MAX - 0xfff, u64::MAX, 1), None);
        assert_eq!(first_fit(core::iter::empty(), 0, u64::MAX, u64::MAX), Some(0));
    }
}
