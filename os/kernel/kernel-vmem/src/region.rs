//! # Regions
//!
//! A [`Region`] describes one contiguous, permission-tagged range of a
//! memory context. Regions are owned by the manager's region table and are
//! addressed by [`RegionId`]; the context they belong to is recorded as a
//! plain [`MemoryContextId`], which never keeps the context alive.

use crate::addresses::VirtualAddress;
use crate::error::MemoryContextError;
use crate::slab::SlabKey;
use alloc::string::String;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use core::fmt;

/// Identifier of a region in the global region-id table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegionId(pub(crate) SlabKey);

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({:?})", self.0)
    }
}

/// Identifier of a memory context.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryContextId(pub(crate) SlabKey);

impl fmt::Debug for MemoryContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryContextId({:?})", self.0)
    }
}

/// Permission and kind bits of a region.
///
/// | Bit | Name      | Meaning |
/// |-----|-----------|---------|
/// | 0   | `read`    | Readable |
/// | 1   | `write`   | Writable |
/// | 2   | `execute` | Executable |
/// | 3   | `kernel`  | Kernel mapping, shared by every address space |
/// | 4   | `stack`   | Thread stack, grows downwards |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct RegionFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub kernel: bool,
    pub stack: bool,
    #[bits(27)]
    __: u32,
}

impl RegionFlags {
    /// Readable and writable user mapping.
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_read(true).with_write(true)
    }

    /// Readable and executable user mapping.
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_read(true).with_execute(true)
    }

    /// Readable and writable kernel mapping.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_read(true).with_write(true).with_kernel(true)
    }
}

/// How the pages behind a region are provided.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum AllocMethod {
    /// Address range reserved, nothing mapped.
    #[default]
    None,
    /// Pages are allocated on first touch.
    Lazy,
    /// Pages are allocated when the region is created.
    Pages,
    /// One physically contiguous run of pages.
    Contiguous,
}

/// Object a region's contents are loaded from (an executable, a mapped file).
///
/// Shared between a parent's region and every clone of it; the number of
/// regions referring to an object is visible through [`Arc::strong_count`].
pub trait BackingObject: Send + Sync {
    fn name(&self) -> &str;
}

/// File-backed part of a region.
#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<dyn BackingObject>,
    pub offset: u64,
    pub size: u64,
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("file", &self.file.name())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// One mapped range of an address space.
#[derive(Debug)]
pub struct Region {
    name: String,
    start: VirtualAddress,
    size: u64,
    flags: RegionFlags,
    alloc_method: AllocMethod,
    backing: Option<FileMapping>,
    context: Option<MemoryContextId>,
}

impl Region {
    /// Describe a new region.
    ///
    /// # Errors
    /// - [`MemoryContextError::InvalidArgument`] for an empty or wrapping
    ///   range.
    /// - [`MemoryContextError::OutOfMemory`] if the name cannot be copied.
    pub fn new(
        name: &str,
        start: VirtualAddress,
        size: u64,
        flags: RegionFlags,
    ) -> Result<Self, MemoryContextError> {
        if start.last_of(size).is_none() {
            return Err(MemoryContextError::InvalidArgument);
        }
        Ok(Self {
            name: try_copy_str(name)?,
            start,
            size,
            flags,
            alloc_method: AllocMethod::None,
            backing: None,
            context: None,
        })
    }

    #[must_use]
    pub const fn with_alloc_method(mut self, method: AllocMethod) -> Self {
        self.alloc_method = method;
        self
    }

    #[must_use]
    pub fn with_backing(mut self, file: Arc<dyn BackingObject>, offset: u64, size: u64) -> Self {
        self.backing = Some(FileMapping { file, offset, size });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Last byte covered by the region.
    #[must_use]
    pub const fn last(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + (self.size - 1))
    }

    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.flags.kernel()
    }

    #[must_use]
    pub const fn alloc_method(&self) -> AllocMethod {
        self.alloc_method
    }

    /// Bytes of physical memory the region holds from the moment it is
    /// created. Lazy and reserved regions hold none.
    #[must_use]
    pub const fn committed_size(&self) -> u64 {
        match self.alloc_method {
            AllocMethod::Pages | AllocMethod::Contiguous => self.size,
            AllocMethod::None | AllocMethod::Lazy => 0,
        }
    }

    #[must_use]
    pub const fn backing(&self) -> Option<&FileMapping> {
        self.backing.as_ref()
    }

    #[must_use]
    pub fn backing_file(&self) -> Option<&Arc<dyn BackingObject>> {
        self.backing.as_ref().map(|b| &b.file)
    }

    /// The context the region is inserted in, if any.
    #[must_use]
    pub const fn context(&self) -> Option<MemoryContextId> {
        self.context
    }

    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.as_u64() >= self.start.as_u64() && address.as_u64() <= self.last().as_u64()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.last().as_u64() && other.start.as_u64() <= self.last().as_u64()
    }

    pub(crate) const fn set_context(&mut self, context: Option<MemoryContextId>) {
        self.context = context;
    }

    pub(crate) const fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// A copy for another context: same extent and flags, the backing
    /// object shared.
    pub(crate) fn duplicate(&self) -> Result<Self, MemoryContextError> {
        Ok(Self {
            name: try_copy_str(&self.name)?,
            start: self.start,
            size: self.size,
            flags: self.flags,
            alloc_method: self.alloc_method,
            backing: self.backing.clone(),
            context: None,
        })
    }
}

fn try_copy_str(s: &str) -> Result<String, MemoryContextError> {
    let mut out = String::new();
    out.try_reserve_exact(s.len())
        .map_err(|_| MemoryContextError::OutOfMemory)?;
    out.push_str(s);
    Ok(out)
}
