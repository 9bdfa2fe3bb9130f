//! In-memory paging backend for host tests.
//!
//! [`MockArch`] keeps the list of mapped ranges per context, records every
//! call it receives and can be told to fail a specific upcoming call.

use crate::arch::{ArchError, ArchMemory};
use crate::region::{MemoryContextId, Region};
use alloc::vec::Vec;
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArchCall {
    Init,
    CloneContext,
    CloneRegion,
    DeleteRegion,
    Resize,
    Destroy,
}

/// Paging state of one mock context.
#[derive(Debug, Default)]
pub struct MockContext {
    pub id: Option<MemoryContextId>,
    /// Whether the shared kernel structure was copied in.
    pub kernel_shared: bool,
    /// `(start, size)` of every range with cloned pages.
    pub mapped: Vec<(u64, u64)>,
}

#[derive(Default)]
pub struct MockArch {
    calls: SpinLock<Vec<ArchCall>>,
    fail: SpinLock<Option<(ArchCall, usize)>>,
    live: SpinLock<usize>,
}

impl MockArch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the call of kind `call` that comes after `skip` more successful
    /// ones.
    pub fn fail_after(&self, call: ArchCall, skip: usize) {
        let at = self.calls(call) + skip;
        *self.fail.lock() = Some((call, at));
    }

    /// Number of calls of kind `call` received so far.
    pub fn calls(&self, call: ArchCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    /// Contexts initialized and not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        *self.live.lock()
    }

    fn record(&self, call: ArchCall) -> Result<(), ArchError> {
        let nth = {
            let mut calls = self.calls.lock();
            let nth = calls.iter().filter(|c| **c == call).count();
            calls.push(call);
            nth
        };
        let mut fail = self.fail.lock();
        if let Some((kind, at)) = *fail
            && kind == call
            && at == nth
        {
            *fail = None;
            return Err(ArchError::OutOfMemory);
        }
        Ok(())
    }
}

impl ArchMemory for MockArch {
    type ContextData = MockContext;

    fn init_memory_context(&self, id: MemoryContextId) -> Result<MockContext, ArchError> {
        self.record(ArchCall::Init)?;
        *self.live.lock() += 1;
        Ok(MockContext {
            id: Some(id),
            ..MockContext::default()
        })
    }

    fn clone_memory_context(&self, _old: &MockContext, new: &mut MockContext) -> Result<(), ArchError> {
        self.record(ArchCall::CloneContext)?;
        new.kernel_shared = true;
        Ok(())
    }

    fn clone_memory_region(
        &self,
        old: &MockContext,
        old_region: &Region,
        new: &mut MockContext,
        new_region: &Region,
    ) -> Result<(), ArchError> {
        self.record(ArchCall::CloneRegion)?;
        assert!(old.id != new.id, "region cloned onto its own context");
        assert_eq!(old_region.size(), new_region.size());
        new.mapped
            .push((new_region.start().as_u64(), new_region.size()));
        Ok(())
    }

    fn delete_region_pages(&self, context: &mut MockContext, region: &Region) {
        let _ = self.record(ArchCall::DeleteRegion);
        let start = region.start().as_u64();
        context.mapped.retain(|(s, _)| *s != start);
    }

    fn resize_region_pages(
        &self,
        context: &mut MockContext,
        region: &Region,
        new_size: u64,
    ) -> Result<(), ArchError> {
        self.record(ArchCall::Resize)?;
        let start = region.start().as_u64();
        if let Some(entry) = context.mapped.iter_mut().find(|(s, _)| *s == start) {
            entry.1 = new_size;
        }
        Ok(())
    }

    fn destroy_memory_context(&self, context: MockContext) {
        let _ = self.record(ArchCall::Destroy);
        assert!(
            context.mapped.is_empty(),
            "context destroyed with mapped pages: {:?}",
            context.mapped
        );
        *self.live.lock() -= 1;
    }
}
