//! # Memory Manager
//!
//! Owner of every memory context. One region lock guards the whole
//! [`RegionTable`]: all contexts, their region sequences and the global
//! region-id table. Mutations of unrelated contexts therefore serialize,
//! and a clone sees a source context that cannot change underneath it.
//!
//! The region lock sits at [`RegionLevel`]. Operations that also touch
//! scheduler-side accounting ([`MemoryManager::create_region`],
//! [`MemoryManager::delete_region`], [`MemoryManager::clone_context`],
//! [`MemoryManager::delete_regions`]) take the scheduler lock while still
//! holding the region lock, which is the only order the lock levels allow.

use crate::addresses::VirtualAddress;
use crate::arch::ArchMemory;
use crate::context::{ContextKind, ContextState, MemoryContext, RegionTable};
use crate::error::MemoryContextError;
use crate::region::{AllocMethod, MemoryContextId, Region, RegionFlags, RegionId};
use kernel_info::AddressLayout;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::ordered::{RegionLevel, SchedulerLevel, Unlocked};
use kernel_sync::{LockCtx, OrderedMutex};
use log::{debug, trace, warn};


pub struct MemoryManager<A: ArchMemory> {
    arch: A,
    layout: AddressLayout,
    table: OrderedMutex<RegionTable<A::ContextData>, RegionLevel>,
}

impl<A: ArchMemory> MemoryManager<A> {
    pub const fn new(arch: A, layout: AddressLayout) -> Self {
        Self {
            arch,
            layout,
            table: OrderedMutex::new(RegionTable::new()),
        }
    }

    pub const fn arch(&self) -> &A {
        &self.arch
    }

    pub const fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    /// Run `f` against the region table with the region lock held.
    pub fn inspect<U>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        f: impl FnOnce(&RegionTable<A::ContextData>) -> U,
    ) -> U {
        self.table.with_lock(lock, |table, _| f(table))
    }

    /// Create the kernel's own context. Called once during boot.
    ///
    /// # Errors
    /// [`MemoryContextError::KernelContextExists`] on a second call, or the
    /// failure of the paging backend.
    pub fn init_kernel_context(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
    ) -> Result<MemoryContextId, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            if table.kernel.is_some() {
                return Err(MemoryContextError::KernelContextExists);
            }
            let id = new_context(&self.arch, table, ContextKind::Kernel, None)?;
            table.kernel = Some(id);
            debug!("kernel memory context {id:?} initialized");
            Ok(id)
        })
    }

    pub fn kernel_context(&self, lock: &mut LockCtx<'_, Unlocked>) -> Option<MemoryContextId> {
        self.table.with_lock(lock, |table, _| table.kernel)
    }

    /// Create an empty user context for the process `owner`.
    ///
    /// # Errors
    /// [`MemoryContextError::OutOfMemory`] or a paging backend failure.
    pub fn create_context(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        owner: Option<u32>,
    ) -> Result<MemoryContextId, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            let id = new_context(&self.arch, table, ContextKind::User, owner)?;
            debug!("memory context {id:?} created for {owner:?}");
            Ok(id)
        })
    }

    /// Unmap whatever is left of a user context and release it.
    ///
    /// # Errors
    /// [`MemoryContextError::KernelContext`] for the kernel context, which is
    /// never destroyed.
    pub fn destroy_context(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
    ) -> Result<(), MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            if table.context(context)?.kind() == ContextKind::Kernel {
                return Err(MemoryContextError::KernelContext);
            }
            teardown_context(&self.arch, table, context);
            debug!("memory context {context:?} destroyed");
            Ok(())
        })
    }

    /// Link `region` into `context` at its place in address order.
    ///
    /// # Errors
    /// See [`RegionTable`] insertion: out-of-half, overlapping, torn-down
    /// context, or no memory to grow the tables.
    pub fn insert_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        region: Region,
    ) -> Result<RegionId, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            let id = table.insert(context, region, &self.layout)?;
            trace!("region {id:?} inserted into {context:?}");
            Ok(id)
        })
    }

    /// Unlink `region` from `context` and hand it back. Its pages stay
    /// mapped; see [`Self::delete_region`].
    ///
    /// # Errors
    /// [`MemoryContextError::InvalidArgument`] if the region is not in the
    /// context.
    pub fn remove_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        region: RegionId,
    ) -> Result<Region, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            let removed = table.remove(context, region)?;
            trace!("region {region:?} removed from {context:?}");
            Ok(removed)
        })
    }

    /// Describe and insert a region in one step.
    ///
    /// With `start` unset, the region is placed at the first gap of the half
    /// of the address space selected by `flags.kernel()`, searched with the
    /// region lock still held. Once the region is in, `account` sees it
    /// under the scheduler lock, nested in the region lock.
    ///
    /// # Errors
    /// As [`Self::find_unmapped_for`] and [`Self::insert_region`].
    #[allow(clippy::too_many_arguments)]
    pub fn create_region<S>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        name: &str,
        start: Option<VirtualAddress>,
        size: u64,
        flags: RegionFlags,
        method: AllocMethod,
        scheduler: &OrderedMutex<S, SchedulerLevel>,
        account: impl FnOnce(&mut S, &Region),
    ) -> Result<RegionId, MemoryContextError> {
        let mut guard = self.table.lock(lock);
        let (table, mut nested) = guard.split();

        let start = match start {
            Some(start) => start,
            None => {
                let (first, last) = self.window_for(flags.kernel());
                table.find_gap(context, first, last, size)?
            }
        };
        let region = Region::new(name, start, size, flags)?.with_alloc_method(method);
        let id = table.insert(context, region, &self.layout)?;
        let region = table.region(id).ok_or(MemoryContextError::InvalidArgument)?;
        scheduler.with_lock(&mut nested, |state, _| account(state, region));
        trace!("region {id:?} '{name}' created at {start} in {context:?}");
        Ok(id)
    }

    /// Remove `region` from `context`, unmap its pages and drop it.
    /// `account` sees the region on its way out, under the scheduler lock
    /// nested in the region lock. Returns the size of the deleted region.
    ///
    /// # Errors
    /// [`MemoryContextError::InvalidArgument`] if the region is not in the
    /// context.
    pub fn delete_region<S>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        region: RegionId,
        scheduler: &OrderedMutex<S, SchedulerLevel>,
        account: impl FnOnce(&mut S, &Region),
    ) -> Result<u64, MemoryContextError> {
        let mut guard = self.table.lock(lock);
        let (table, mut nested) = guard.split();

        let removed = table.remove(context, region)?;
        if let Some(data) = table.context_mut(context)?.arch_mut() {
            self.arch.delete_region_pages(data, &removed);
        }
        scheduler.with_lock(&mut nested, |state, _| account(state, &removed));
        trace!("region {region:?} deleted from {context:?}");
        Ok(removed.size())
    }

    /// First-fit search for `size` free bytes in the window `[start, end)`.
    ///
    /// The first page is never handed out: the window's lower bound is
    /// raised to [`PAGE_SIZE`].
    ///
    /// # Errors
    /// - [`MemoryContextError::InvalidArgument`] for a zero size.
    /// - [`MemoryContextError::NotFound`] if no gap is large enough.
    pub fn find_unmapped(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        start: VirtualAddress,
        end: VirtualAddress,
        size: u64,
    ) -> Result<VirtualAddress, MemoryContextError> {
        let first = start.as_u64().max(PAGE_SIZE);
        let Some(last) = end.as_u64().checked_sub(1) else {
            return Err(MemoryContextError::NotFound);
        };
        self.table
            .with_lock(lock, |table, _| table.find_gap(context, first, last, size))
    }

    /// First-fit search over the user or the kernel half.
    ///
    /// # Errors
    /// As [`Self::find_unmapped`].
    pub fn find_unmapped_for(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        size: u64,
        kernel: bool,
    ) -> Result<VirtualAddress, MemoryContextError> {
        let (first, last) = self.window_for(kernel);
        self.table
            .with_lock(lock, |table, _| table.find_gap(context, first, last, size))
    }

    /// Whether `region` could be resized to `new_size` right now.
    ///
    /// The answer is stale as soon as the lock is dropped; use
    /// [`Self::resize_region`] to act on it.
    pub fn can_resize(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        region: RegionId,
        new_size: u64,
    ) -> bool {
        self.table.with_lock(lock, |table, _| {
            table.can_resize(context, region, new_size, &self.layout)
        })
    }

    /// Grow or shrink `region` in place, checked and applied under one lock.
    ///
    /// # Errors
    /// - [`MemoryContextError::InvalidArgument`] if the new extent would
    ///   collide with the next region or leave the address-space half.
    /// - [`MemoryContextError::Arch`] if the paging backend cannot follow.
    pub fn resize_region(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        region: RegionId,
        new_size: u64,
    ) -> Result<(), MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            if !table.can_resize(context, region, new_size, &self.layout) {
                return Err(MemoryContextError::InvalidArgument);
            }
            let RegionTable {
                contexts, regions, ..
            } = table;
            let ctx = contexts
                .get_mut(context.0)
                .ok_or(MemoryContextError::UnknownContext)?;
            if ctx.state() == ContextState::TornDown {
                return Err(MemoryContextError::TornDown);
            }
            let target = regions
                .get_mut(region.0)
                .ok_or(MemoryContextError::InvalidArgument)?;
            if let Some(data) = ctx.arch_mut() {
                self.arch.resize_region_pages(data, target, new_size)?;
            }
            trace!(
                "region {region:?} resized from {:#x} to {new_size:#x}",
                target.size()
            );
            target.set_size(new_size);
            Ok(())
        })
    }

    /// The region of `context` covering `address`, if any.
    ///
    /// # Errors
    /// [`MemoryContextError::UnknownContext`] for a stale context id.
    pub fn region_at(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        address: VirtualAddress,
    ) -> Result<Option<RegionId>, MemoryContextError> {
        self.table
            .with_lock(lock, |table, _| table.region_at(context, address))
    }

    /// Run `f` on a region.
    ///
    /// # Errors
    /// [`MemoryContextError::InvalidArgument`] for an unknown region id.
    pub fn with_region<U>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        region: RegionId,
        f: impl FnOnce(&Region) -> U,
    ) -> Result<U, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            table
                .region(region)
                .map(f)
                .ok_or(MemoryContextError::InvalidArgument)
        })
    }

    /// # Errors
    /// [`MemoryContextError::UnknownContext`] for a stale context id.
    pub fn context_state(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
    ) -> Result<ContextState, MemoryContextError> {
        self.table
            .with_lock(lock, |table, _| table.context(context).map(MemoryContext::state))
    }

    /// Bytes of address space covered by the regions of `context`.
    ///
    /// # Errors
    /// [`MemoryContextError::UnknownContext`] for a stale context id.
    pub fn context_size(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
    ) -> Result<u64, MemoryContextError> {
        self.table.with_lock(lock, |table, _| {
            Ok(table.regions_of(context)?.map(|(_, r)| r.size()).sum())
        })
    }

    /// Duplicate `old` into a new user context owned by `owner`.
    ///
    /// Kernel regions are left out; they are shared by every context through
    /// [`ArchMemory::clone_memory_context`]. Every other region is copied
    /// with its flags and extent, shares its backing object with the source
    /// and gets its pages cloned by the paging backend. On failure every
    /// region cloned so far and the new context itself are torn down in
    /// reverse order.
    ///
    /// Once the copy is complete, `account` runs under the scheduler lock,
    /// nested in the region lock, to carry over the memory counters.
    ///
    /// # Errors
    /// - [`MemoryContextError::TornDown`] if `old` has been torn down.
    /// - [`MemoryContextError::OutOfMemory`] or [`MemoryContextError::Arch`]
    ///   when a copy cannot be made.
    ///
    /// # Panics
    /// If a kernel region of `old` has a backing object.
    pub fn clone_context<S>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        old: MemoryContextId,
        owner: Option<u32>,
        scheduler: &OrderedMutex<S, SchedulerLevel>,
        account: impl FnOnce(&mut S),
    ) -> Result<MemoryContextId, MemoryContextError> {
        let mut guard = self.table.lock(lock);
        let (table, mut nested) = guard.split();

        match table.context(old)?.state() {
            ContextState::TornDown => return Err(MemoryContextError::TornDown),
            ContextState::Uninitialized => return Err(MemoryContextError::InvalidArgument),
            ContextState::Initialized | ContextState::Populated => {}
        }

        let new = new_context(&self.arch, table, ContextKind::User, owner)?;
        let mut rollback = Rollback {
            arch: &self.arch,
            table,
            context: new,
            armed: true,
        };
        let cloned = self.clone_regions(rollback.table, old, new)?;
        rollback.armed = false;
        drop(rollback);

        scheduler.with_lock(&mut nested, |state, _| account(state));
        debug!("memory context {old:?} cloned into {new:?} ({cloned} regions)");
        Ok(new)
    }

    fn clone_regions(
        &self,
        table: &mut RegionTable<A::ContextData>,
        old: MemoryContextId,
        new: MemoryContextId,
    ) -> Result<usize, MemoryContextError> {
        {
            let (source, target) = table
                .contexts
                .get_pair(old.0, new.0)
                .ok_or(MemoryContextError::UnknownContext)?;
            let (Some(from), Some(to)) = (source.arch(), target.arch_mut()) else {
                return Err(MemoryContextError::InvalidArgument);
            };
            self.arch.clone_memory_context(from, to)?;
        }

        let count = table.context(old)?.regions().len();
        let mut cloned = 0;
        for index in 0..count {
            let source_id = table.context(old)?.regions()[index];
            let copy = {
                let RegionTable {
                    contexts, regions, ..
                } = &mut *table;
                let source = regions
                    .get(source_id.0)
                    .ok_or(MemoryContextError::InvalidArgument)?;
                if source.is_kernel() {
                    assert!(
                        source.backing().is_none(),
                        "kernel region '{}' has a backing object",
                        source.name()
                    );
                    continue;
                }

                let copy = source.duplicate()?;
                let (from, to) = contexts
                    .get_pair(old.0, new.0)
                    .ok_or(MemoryContextError::UnknownContext)?;
                let (Some(from), Some(to)) = (from.arch(), to.arch_mut()) else {
                    return Err(MemoryContextError::InvalidArgument);
                };
                self.arch.clone_memory_region(from, source, to, &copy)?;
                copy
            };

            if let Err(e) = table.insert(new, copy, &self.layout) {
                // pages of the lost copy span the source's extent
                let RegionTable {
                    contexts, regions, ..
                } = &mut *table;
                if let (Some(source), Some(data)) = (
                    regions.get(source_id.0),
                    contexts.get_mut(new.0).and_then(MemoryContext::arch_mut),
                ) {
                    self.arch.delete_region_pages(data, source);
                }
                return Err(e);
            }
            cloned += 1;
        }
        Ok(cloned)
    }

    /// Tear down every region of a user context at process exit.
    ///
    /// The context keeps its paging state until [`Self::destroy_context`]
    /// but accepts no further mutation. `account` runs under the scheduler
    /// lock, nested in the region lock, to clear the memory counters.
    ///
    /// # Errors
    /// - [`MemoryContextError::KernelContext`] for the kernel context.
    /// - [`MemoryContextError::TornDown`] if already torn down.
    ///
    /// # Panics
    /// If the context holds a kernel region.
    pub fn delete_regions<S>(
        &self,
        lock: &mut LockCtx<'_, Unlocked>,
        context: MemoryContextId,
        scheduler: &OrderedMutex<S, SchedulerLevel>,
        account: impl FnOnce(&mut S),
    ) -> Result<(), MemoryContextError> {
        let mut guard = self.table.lock(lock);
        let (table, mut nested) = guard.split();

        let RegionTable {
            contexts, regions, ..
        } = table;
        let ctx = contexts
            .get_mut(context.0)
            .ok_or(MemoryContextError::UnknownContext)?;
        match (ctx.kind(), ctx.state()) {
            (ContextKind::Kernel, _) => return Err(MemoryContextError::KernelContext),
            (_, ContextState::TornDown) => return Err(MemoryContextError::TornDown),
            (_, ContextState::Uninitialized) => return Err(MemoryContextError::InvalidArgument),
            _ => {}
        }

        let ids = core::mem::take(ctx.regions_mut());
        let count = ids.len();
        for id in ids {
            let Some(region) = regions.remove(id.0) else {
                continue;
            };
            assert!(
                !region.is_kernel(),
                "kernel region '{}' in user memory context {context:?}",
                region.name()
            );
            if let Some(data) = ctx.arch_mut() {
                self.arch.delete_region_pages(data, &region);
            }
        }
        ctx.set_state(ContextState::TornDown);

        scheduler.with_lock(&mut nested, |state, _| account(state));
        debug!("memory context {context:?} torn down ({count} regions)");
        Ok(())
    }

    /// `[first, last]` of the half selected by `kernel`, above the null page.
    fn window_for(&self, kernel: bool) -> (u64, u64) {
        let (first, last) = self.layout.bounds(kernel);
        (first.max(PAGE_SIZE), last)
    }
}

/// Register a context and build its paging state.
fn new_context<A: ArchMemory>(
    arch: &A,
    table: &mut RegionTable<A::ContextData>,
    kind: ContextKind,
    owner: Option<u32>,
) -> Result<MemoryContextId, MemoryContextError> {
    let key = table
        .contexts
        .insert(MemoryContext::new(kind, owner))
        .map_err(|_| MemoryContextError::OutOfMemory)?;
    let id = MemoryContextId(key);
    match arch.init_memory_context(id) {
        Ok(data) => {
            table.context_mut(id)?.set_arch(data);
            Ok(id)
        }
        Err(e) => {
            table.contexts.remove(key);
            Err(e.into())
        }
    }
}

/// Drop every region of `context` newest first, then the context itself.
fn teardown_context<A: ArchMemory>(
    arch: &A,
    table: &mut RegionTable<A::ContextData>,
    context: MemoryContextId,
) {
    let RegionTable {
        contexts, regions, ..
    } = table;
    let Some(ctx) = contexts.get_mut(context.0) else {
        return;
    };
    while let Some(id) = ctx.regions_mut().pop() {
        if let Some(region) = regions.remove(id.0)
            && let Some(data) = ctx.arch_mut()
        {
            arch.delete_region_pages(data, &region);
        }
    }
    if let Some(data) = ctx.take_arch() {
        arch.destroy_memory_context(data);
    }
    contexts.remove(context.0);
}

/// Tears down a partially cloned context unless disarmed.
struct Rollback<'t, A: ArchMemory> {
    arch: &'t A,
    table: &'t mut RegionTable<A::ContextData>,
    context: MemoryContextId,
    armed: bool,
}

impl<A: ArchMemory> Drop for Rollback<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            warn!("clone into {:?} failed, unwinding", self.context);
            teardown_context(self.arch, self.table, self.context);
        }
    }
}
