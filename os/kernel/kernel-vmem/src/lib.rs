//! # Virtual Memory Contexts
//!
//! Region bookkeeping for the kernel's and every process's address space.
//!
//! ```text
//!            MemoryManager<A: ArchMemory>
//!  ┌─────────────────────────────────────────────────┐
//!  │ region lock (RegionLevel)                       │
//!  │  ┌───────────────────────────────────────────┐  │
//!  │  │ RegionTable                               │  │
//!  │  │   contexts: Slab<MemoryContext>           │  │
//!  │  │     kernel ─► [r0]                        │  │
//!  │  │     pid 7  ─► [r3, r1, r4]  (by start)    │  │
//!  │  │   regions:  Slab<Region>  (region ids)    │  │
//!  │  └───────────────────────────────────────────┘  │
//!  └──────────────────────┬──────────────────────────┘
//!                         │ init / clone / delete pages
//!                         ▼
//!                  ArchMemory (page tables)
//! ```
//!
//! Within one context regions are kept ordered by start address and never
//! overlap. Kernel regions live in the kernel context; user contexts share
//! them through the paging backend and never carry a copy.
//!
//! ## Address windows
//!
//! Every bound is inclusive except the `end` of
//! [`MemoryManager::find_unmapped`], which is exclusive. The first page of
//! the address space is never returned by a gap search.
//!
//! ## Usage
//! ```rust
//! use kernel_info::AddressLayout;
//! use kernel_sync::{LockCtx, OrderedMutex};
//! use kernel_sync::ordered::SchedulerLevel;
//! use kernel_vmem::{
//!     AllocMethod, ArchError, ArchMemory, MemoryContextId, MemoryManager, Region, RegionFlags,
//!     VirtualAddress,
//! };
//!
//! /// Backend without page tables: nothing is ever mapped.
//! struct NoPaging;
//!
//! impl ArchMemory for NoPaging {
//!     type ContextData = ();
//!     fn init_memory_context(&self, _: MemoryContextId) -> Result<(), ArchError> { Ok(()) }
//!     fn clone_memory_context(&self, _: &(), _: &mut ()) -> Result<(), ArchError> { Ok(()) }
//!     fn clone_memory_region(&self, _: &(), _: &Region, _: &mut (), _: &Region) -> Result<(), ArchError> {
//!         Ok(())
//!     }
//!     fn delete_region_pages(&self, _: &mut (), _: &Region) {}
//!     fn destroy_memory_context(&self, _: ()) {}
//! }
//!
//! let vmm = MemoryManager::new(NoPaging, AddressLayout::default());
//! let sched = OrderedMutex::<u64, SchedulerLevel>::new(0);
//! let mut lock = LockCtx::new();
//!
//! let parent = vmm.create_context(&mut lock, Some(1)).unwrap();
//! vmm.create_region(
//!     &mut lock, parent, "heap", Some(VirtualAddress::new(0x1000)),
//!     0x1000, RegionFlags::user_rw(), AllocMethod::Lazy,
//!     &sched, |vmem, region| *vmem += region.size(),
//! ).unwrap();
//!
//! let gap = vmm
//!     .find_unmapped(&mut lock, parent, VirtualAddress::new(0), VirtualAddress::new(0x10000), 0x1000)
//!     .unwrap();
//! assert_eq!(gap, VirtualAddress::new(0x2000));
//!
//! let child = vmm.clone_context(&mut lock, parent, Some(2), &sched, |vmem| *vmem *= 2).unwrap();
//! assert_eq!(*sched.lock(&mut lock), 0x2000);
//! assert_eq!(vmm.context_size(&mut lock, child).unwrap(), 0x1000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addresses;
pub mod arch;
pub mod context;
mod error;
mod manager;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod region;
pub mod slab;

pub use addresses::VirtualAddress;
pub use arch::{ArchError, ArchMemory};
pub use context::{ContextKind, ContextState, MemoryContext, RegionTable};
pub use error::MemoryContextError;
pub use manager::MemoryManager;
pub use region::{
    AllocMethod, BackingObject, FileMapping, MemoryContextId, Region, RegionFlags, RegionId,
};
