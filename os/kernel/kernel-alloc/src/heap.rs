//! # Block/Chunk Heap
//!
//! The kernel heap draws *blocks* of whole pages from a [`PageAlloc`] and
//! carves each block into variable-size *chunks*.
//!
//! ```text
//! block base
//! +-------------+--------------+---------+--------------+---------+-----
//! | BlockHeader | ChunkHeader  | payload | ChunkHeader  | payload | ...
//! +-------------+--------------+---------+--------------+---------+-----
//!               ^ FIRST_CHUNK             ^ FIRST_CHUNK + CHUNK_HEADER + size
//! ```
//!
//! Chunks of a block form a doubly linked list in address order. Links are
//! byte offsets from the block base (`u32`), so every hop is bounds checked
//! against the block and a stale link can never leave it. Blocks form a
//! singly linked list; new blocks are pushed at the head.
//!
//! ## Invariants
//! - The chunk sizes plus one header per chunk add up to the block capacity.
//! - No two neighbouring chunks are both free after a release.
//! - `biggest_free` equals the largest free chunk of the block. Allocation
//!   recomputes it by a full scan; release only raises it, which is exact
//!   because the merged chunk is at least as large as every chunk it absorbed.

use crate::PageAlloc;
use core::mem::size_of;
use core::ptr::NonNull;
use kernel_info::HeapConfig;
use kernel_info::memory::PAGE_SIZE_BYTES;
use log::{debug, error, trace};

const BLOCK_MAGIC: u32 = 0xCAFE_BABE;
const CHUNK_MAGIC: u32 = 0xDEAD_BEEF;

const CHUNK_FREE: u32 = 1;
const CHUNK_ALLOCATED: u32 = 2;

/// End-of-list marker for chunk links.
const NIL: u32 = u32::MAX;

/// Alignment of every payload and every request size.
pub const CHUNK_ALIGN: usize = 16;

/// Bytes of bookkeeping in front of every chunk payload.
pub const CHUNK_HEADER: usize = size_of::<ChunkHeader>();

/// Bytes of bookkeeping at the base of every block.
pub const BLOCK_HEADER: usize = size_of::<BlockHeader>();

/// A split leaves a free remainder only if it exceeds a header plus this.
const SPLIT_SLACK: usize = 4;

/// Offset of the first chunk header in a block.
#[allow(clippy::cast_possible_truncation)]
const FIRST_CHUNK: u32 = BLOCK_HEADER as u32;

/// Largest block; chunk offsets are `u32`.
const MAX_BLOCK_BYTES: usize = (u32::MAX as usize + 1) - PAGE_SIZE_BYTES;

#[repr(C, align(16))]
struct BlockHeader {
    magic: u32,
    pages: u32,
    biggest_free: usize,
    next: Option<NonNull<BlockHeader>>,
}

#[repr(C, align(16))]
struct ChunkHeader {
    magic: u32,
    kind: u32,
    /// Payload bytes, excluding this header.
    size: usize,
    /// Offset of this header from the block base.
    offset: u32,
    prev: u32,
    next: u32,
}

const _: () = {
    assert!(CHUNK_HEADER % CHUNK_ALIGN == 0);
    assert!(BLOCK_HEADER % CHUNK_ALIGN == 0);
    assert!(PAGE_SIZE_BYTES > BLOCK_HEADER + CHUNK_HEADER);
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("allocation of {0} bytes exceeds the largest heap block")]
    TooLarge(usize),
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("heap is already initialized")]
    AlreadyInitialized,
}

/// Heap-wide totals.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub blocks: usize,
    pub pages: usize,
    /// Sum of free chunk payloads.
    pub free_bytes: usize,
    /// Sum of allocated chunk payloads.
    pub allocated_bytes: usize,
    pub free_chunks: usize,
    pub allocated_chunks: usize,
}

/// Snapshot of one block.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BlockStats {
    pub pages: usize,
    /// Bytes available to chunks (headers and payloads).
    pub capacity: usize,
    /// The cached maximum free chunk size.
    pub biggest_free: usize,
    /// The actual maximum free chunk size.
    pub largest_free_chunk: usize,
    pub chunks: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
}

/// First-fit heap over page blocks.
///
/// Not synchronized; see [`KernelHeap`](crate::KernelHeap) for the locked
/// global instance.
pub struct Heap<P: PageAlloc> {
    pages: P,
    config: HeapConfig,
    /// The boot-time block; never reclaimed.
    root: NonNull<BlockHeader>,
    /// Most recently created block.
    head: NonNull<BlockHeader>,
}

// Safety: the heap exclusively owns its blocks; raw pointers never escape
// except as payload pointers handed to callers.
unsafe impl<P: PageAlloc + Send> Send for Heap<P> {}

impl<P: PageAlloc> Heap<P> {
    /// Create a heap with a root block of `config.root_pages` pages.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the page allocator cannot provide the
    /// root block.
    pub fn new(pages: P, config: HeapConfig) -> Result<Self, HeapError> {
        let root_pages = config.root_pages.max(1);
        let root = create_block(&pages, root_pages)?;
        debug!("kernel heap: root block of {root_pages} pages");
        Ok(Self {
            pages,
            config,
            root,
            head: root,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub const fn page_alloc(&self) -> &P {
        &self.pages
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// # Errors
    /// - [`HeapError::TooLarge`] if no block could ever hold the request.
    /// - [`HeapError::OutOfMemory`] if a new block is needed and the page
    ///   allocator is exhausted.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let size = round_request(size)?;

        let mut cursor = Some(self.head);
        while let Some(block) = cursor {
            let b = block.as_ptr();
            // Safety: every block in the list is live and owned by us.
            unsafe {
                if (*b).biggest_free >= size
                    && let Some(ptr) = allocate_in_block(block, size)
                {
                    return Ok(ptr);
                }
                cursor = (*b).next;
            }
        }

        let block = self.grow(size)?;
        // Safety: freshly created and linked.
        unsafe { allocate_in_block(block, size) }.ok_or(HeapError::OutOfMemory)
    }

    /// Return a chunk to the heap.
    ///
    /// # Panics
    /// Halts on a corrupted chunk or block header, or on a double free.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// heap, and must not be used afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let chunk = ptr.as_ptr().wrapping_sub(CHUNK_HEADER).cast::<ChunkHeader>();

        // Safety: caller contract; headers are validated before use.
        unsafe {
            if (*chunk).magic != CHUNK_MAGIC {
                error!(
                    "kernel heap: bad chunk magic {:#x} in front of {ptr:p}",
                    (*chunk).magic
                );
                panic!("kernel heap corruption at {ptr:p}");
            }
            if (*chunk).kind != CHUNK_ALLOCATED {
                error!(
                    "kernel heap: chunk at {ptr:p} has kind {} on release",
                    (*chunk).kind
                );
                panic!("kernel heap: double free of {ptr:p}");
            }

            let base = chunk.cast::<u8>().wrapping_sub((*chunk).offset as usize);
            let block = NonNull::new_unchecked(base.cast::<BlockHeader>());
            if (*block.as_ptr()).magic != BLOCK_MAGIC {
                error!("kernel heap: bad block magic for chunk at {ptr:p}");
                panic!("kernel heap corruption at {ptr:p}");
            }

            (*chunk).kind = CHUNK_FREE;
            let mut merged = chunk;

            let next = (*chunk).next;
            if next != NIL {
                let n = chunk_at(block, next);
                if (*n).kind == CHUNK_FREE {
                    absorb(block, chunk, n);
                }
            }

            let prev = (*chunk).prev;
            if prev != NIL {
                let p = chunk_at(block, prev);
                if (*p).kind == CHUNK_FREE {
                    absorb(block, p, chunk);
                    merged = p;
                }
            }

            let b = block.as_ptr();
            if (*merged).size > (*b).biggest_free {
                (*b).biggest_free = (*merged).size;
            }

            if self.config.reclaim_empty_blocks && block != self.root && block_is_empty(block) {
                self.reclaim(block);
            }
        }
    }

    /// Size of the payload behind `ptr`, which may exceed the request.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this heap.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe {
            let chunk = ptr.as_ptr().sub(CHUNK_HEADER).cast::<ChunkHeader>();
            assert_eq!((*chunk).magic, CHUNK_MAGIC, "kernel heap corruption");
            (*chunk).size
        }
    }

    /// Visit every block, newest first.
    pub fn for_each_block(&self, mut f: impl FnMut(&BlockStats)) {
        let mut cursor = Some(self.head);
        while let Some(block) = cursor {
            f(&block_stats(block));
            // Safety: live block.
            cursor = unsafe { (*block.as_ptr()).next };
        }
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut cursor = Some(self.head);
        while let Some(block) = cursor {
            stats.blocks += 1;
            // Safety: live block; chunk offsets are bounds checked.
            unsafe {
                stats.pages += (*block.as_ptr()).pages as usize;
                for_each_chunk(block, |c| {
                    if (*c).kind == CHUNK_FREE {
                        stats.free_chunks += 1;
                        stats.free_bytes += (*c).size;
                    } else {
                        stats.allocated_chunks += 1;
                        stats.allocated_bytes += (*c).size;
                    }
                });
                cursor = (*block.as_ptr()).next;
            }
        }
        stats
    }

    /// Walk every block and assert the structural invariants.
    ///
    /// # Panics
    /// On the first violated invariant.
    pub fn verify(&self) {
        let mut cursor = Some(self.head);
        while let Some(block) = cursor {
            // Safety: live block; chunk offsets are bounds checked.
            unsafe {
                let b = block.as_ptr();
                assert_eq!((*b).magic, BLOCK_MAGIC, "block magic");

                let mut prev = NIL;
                let mut prev_free = false;
                let mut covered = 0usize;
                let mut largest = 0usize;
                let mut off = FIRST_CHUNK;
                while off != NIL {
                    let c = chunk_at(block, off);
                    assert_eq!((*c).magic, CHUNK_MAGIC, "chunk magic at {off}");
                    assert_eq!((*c).offset, off, "chunk offset at {off}");
                    assert_eq!((*c).prev, prev, "chunk back link at {off}");
                    let free = (*c).kind == CHUNK_FREE;
                    assert!(!(free && prev_free), "adjacent free chunks at {off}");
                    if free {
                        largest = largest.max((*c).size);
                    }
                    covered += CHUNK_HEADER + (*c).size;
                    if (*c).next != NIL {
                        assert_eq!(
                            (*c).next as usize,
                            off as usize + CHUNK_HEADER + (*c).size,
                            "chunk at {off} is not contiguous with its successor"
                        );
                    }
                    prev = off;
                    prev_free = free;
                    off = (*c).next;
                }
                assert_eq!(covered, block_capacity(block), "block coverage");
                assert_eq!((*b).biggest_free, largest, "cached biggest free chunk");
                cursor = (*b).next;
            }
        }
    }

    fn grow(&mut self, size: usize) -> Result<NonNull<BlockHeader>, HeapError> {
        let needed = size + BLOCK_HEADER + CHUNK_HEADER;
        let pages = needed.div_ceil(PAGE_SIZE_BYTES).max(self.config.block_pages);
        let block = create_block(&self.pages, pages)?;
        // Safety: freshly initialized block.
        unsafe { (*block.as_ptr()).next = Some(self.head) };
        self.head = block;
        debug!("kernel heap: new {pages}-page block for a {size}-byte request");
        Ok(block)
    }

    /// Unlink an empty block and give its pages back.
    unsafe fn reclaim(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            let next = (*block.as_ptr()).next;
            if self.head == block {
                // the root is never reclaimed, so the list stays non-empty
                if let Some(next) = next {
                    self.head = next;
                } else {
                    return;
                }
            } else {
                let mut cursor = self.head;
                loop {
                    let c = cursor.as_ptr();
                    match (*c).next {
                        Some(n) if n == block => {
                            (*c).next = next;
                            break;
                        }
                        Some(n) => cursor = n,
                        None => return,
                    }
                }
            }

            let pages = (*block.as_ptr()).pages as usize;
            (*block.as_ptr()).magic = 0;
            trace!("kernel heap: returning empty {pages}-page block");
            self.pages.free_pages(block.cast(), pages);
        }
    }
}

impl<P: PageAlloc> Drop for Heap<P> {
    fn drop(&mut self) {
        let mut cursor = Some(self.head);
        while let Some(block) = cursor {
            // Safety: every block came from `self.pages` and is unreferenced
            // once the heap goes away.
            unsafe {
                cursor = (*block.as_ptr()).next;
                let pages = (*block.as_ptr()).pages as usize;
                self.pages.free_pages(block.cast(), pages);
            }
        }
    }
}

fn round_request(size: usize) -> Result<usize, HeapError> {
    size.max(1)
        .checked_next_multiple_of(CHUNK_ALIGN)
        .filter(|s| *s <= MAX_BLOCK_BYTES - BLOCK_HEADER - CHUNK_HEADER)
        .ok_or(HeapError::TooLarge(size))
}

#[allow(clippy::cast_possible_truncation)]
fn create_block<P: PageAlloc>(pages: &P, count: usize) -> Result<NonNull<BlockHeader>, HeapError> {
    let bytes = count
        .checked_mul(PAGE_SIZE_BYTES)
        .filter(|b| *b <= MAX_BLOCK_BYTES)
        .ok_or(HeapError::TooLarge(count.saturating_mul(PAGE_SIZE_BYTES)))?;
    let base = pages.alloc_pages(count).ok_or(HeapError::OutOfMemory)?;
    let block = base.cast::<BlockHeader>();
    let payload = bytes - BLOCK_HEADER - CHUNK_HEADER;

    // Safety: fresh, page-aligned pages of `bytes` length.
    unsafe {
        block.as_ptr().write(BlockHeader {
            magic: BLOCK_MAGIC,
            pages: count as u32,
            biggest_free: payload,
            next: None,
        });
        chunk_at(block, FIRST_CHUNK).write(ChunkHeader {
            magic: CHUNK_MAGIC,
            kind: CHUNK_FREE,
            size: payload,
            offset: FIRST_CHUNK,
            prev: NIL,
            next: NIL,
        });
    }
    Ok(block)
}

/// Bytes of a block available to chunks.
unsafe fn block_capacity(block: NonNull<BlockHeader>) -> usize {
    unsafe { (*block.as_ptr()).pages as usize * PAGE_SIZE_BYTES - BLOCK_HEADER }
}

/// Resolve a chunk offset, refusing offsets outside the block.
unsafe fn chunk_at(block: NonNull<BlockHeader>, offset: u32) -> *mut ChunkHeader {
    unsafe {
        let bytes = (*block.as_ptr()).pages as usize * PAGE_SIZE_BYTES;
        assert!(
            offset as usize >= BLOCK_HEADER && offset as usize + CHUNK_HEADER <= bytes,
            "kernel heap corruption: chunk offset {offset:#x} outside block"
        );
        block.as_ptr().cast::<u8>().add(offset as usize).cast()
    }
}

unsafe fn for_each_chunk(block: NonNull<BlockHeader>, mut f: impl FnMut(*mut ChunkHeader)) {
    let mut off = FIRST_CHUNK;
    while off != NIL {
        unsafe {
            let c = chunk_at(block, off);
            f(c);
            off = (*c).next;
        }
    }
}

unsafe fn block_is_empty(block: NonNull<BlockHeader>) -> bool {
    unsafe {
        let first = chunk_at(block, FIRST_CHUNK);
        (*first).kind == CHUNK_FREE && (*first).next == NIL
    }
}

/// Merge `right` into its free left neighbour `left`.
unsafe fn absorb(block: NonNull<BlockHeader>, left: *mut ChunkHeader, right: *mut ChunkHeader) {
    unsafe {
        (*left).size += CHUNK_HEADER + (*right).size;
        (*left).next = (*right).next;
        if (*right).next != NIL {
            (*chunk_at(block, (*right).next)).prev = (*left).offset;
        }
        // a stale pointer to the absorbed chunk must not pass validation
        (*right).magic = 0;
    }
}

unsafe fn scan_biggest_free(block: NonNull<BlockHeader>) -> usize {
    let mut biggest = 0;
    unsafe {
        for_each_chunk(block, |c| {
            if (*c).kind == CHUNK_FREE {
                biggest = biggest.max((*c).size);
            }
        });
    }
    biggest
}

/// First fit within one block; splits the chosen chunk when worthwhile.
#[allow(clippy::cast_possible_truncation)]
unsafe fn allocate_in_block(block: NonNull<BlockHeader>, size: usize) -> Option<NonNull<u8>> {
    unsafe {
        let mut off = FIRST_CHUNK;
        while off != NIL {
            let c = chunk_at(block, off);
            if (*c).kind == CHUNK_FREE && (*c).size >= size {
                let remainder = (*c).size - size;
                if remainder > CHUNK_HEADER + SPLIT_SLACK {
                    let split = off + (CHUNK_HEADER + size) as u32;
                    let next = (*c).next;
                    chunk_at(block, split).write(ChunkHeader {
                        magic: CHUNK_MAGIC,
                        kind: CHUNK_FREE,
                        size: remainder - CHUNK_HEADER,
                        offset: split,
                        prev: off,
                        next,
                    });
                    if next != NIL {
                        (*chunk_at(block, next)).prev = split;
                    }
                    (*c).next = split;
                    (*c).size = size;
                }
                (*c).kind = CHUNK_ALLOCATED;
                (*block.as_ptr()).biggest_free = scan_biggest_free(block);
                return NonNull::new(c.cast::<u8>().add(CHUNK_HEADER));
            }
            off = (*c).next;
        }
        None
    }
}

fn block_stats(block: NonNull<BlockHeader>) -> BlockStats {
    // Safety: callers pass live blocks only.
    unsafe {
        let b = block.as_ptr();
        let mut stats = BlockStats {
            pages: (*b).pages as usize,
            capacity: block_capacity(block),
            biggest_free: (*b).biggest_free,
            ..BlockStats::default()
        };
        for_each_chunk(block, |c| {
            stats.chunks += 1;
            if (*c).kind == CHUNK_FREE {
                stats.free_chunks += 1;
                stats.free_bytes += (*c).size;
                stats.largest_free_chunk = stats.largest_free_chunk.max((*c).size);
            }
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostPageAlloc;

    fn small_heap(pages: &HostPageAlloc, reclaim: bool) -> Heap<&HostPageAlloc> {
        Heap::new(
            pages,
            HeapConfig {
                root_pages: 1,
                block_pages: 1,
                reclaim_empty_blocks: reclaim,
            },
        )
        .unwrap()
    }

    fn root_block(heap: &Heap<&HostPageAlloc>) -> BlockStats {
        let mut last = BlockStats::default();
        heap.for_each_block(|b| last = *b);
        last
    }

    #[test]
    fn header_sizes() {
        assert_eq!(CHUNK_HEADER, 32);
        assert_eq!(BLOCK_HEADER, 32);
    }

    #[test]
    fn fresh_heap_is_one_free_chunk() {
        let pages = HostPageAlloc::new();
        let heap = small_heap(&pages, false);
        let stats = heap.stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.free_bytes, 4096 - BLOCK_HEADER - CHUNK_HEADER);
        heap.verify();
    }

    #[test]
    fn round_trip_restores_free_bytes_and_reuses_block() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, false);
        let before = heap.stats();

        let p = heap.allocate(100).unwrap();
        assert_eq!(p.as_ptr() as usize % CHUNK_ALIGN, 0);
        assert_eq!(unsafe { heap.usable_size(p) }, 112);
        heap.verify();
        unsafe { heap.release(p) };

        assert_eq!(heap.stats(), before);
        let q = heap.allocate(100).unwrap();
        assert_eq!(heap.stats().blocks, 1);
        assert_eq!(p, q);
        heap.verify();
    }

    #[test]
    fn small_remainder_is_not_split() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, false);
        let capacity = 4096 - BLOCK_HEADER - CHUNK_HEADER;

        // leaves exactly a header plus 16 bytes: worth splitting
        let a = heap.allocate(capacity - CHUNK_HEADER - 16).unwrap();
        assert_eq!(heap.stats().free_chunks, 1);
        unsafe { heap.release(a) };

        // leaves exactly one header: absorbed into the allocation
        let b = heap.allocate(capacity - CHUNK_HEADER).unwrap();
        assert_eq!(heap.stats().free_chunks, 0);
        assert_eq!(unsafe { heap.usable_size(b) }, capacity);
        heap.verify();
    }

    #[test]
    fn coalesces_in_every_release_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let pages = HostPageAlloc::new();
            let mut heap = small_heap(&pages, false);
            let capacity = root_block(&heap).capacity;

            let chunks = [
                heap.allocate(64).unwrap(),
                heap.allocate(64).unwrap(),
                heap.allocate(64).unwrap(),
            ];
            for i in order {
                unsafe { heap.release(chunks[i]) };
                heap.verify();
            }

            let root = root_block(&heap);
            assert_eq!(root.chunks, 1, "order {order:?}");
            assert_eq!(root.free_chunks, 1);
            assert_eq!(root.largest_free_chunk, capacity - CHUNK_HEADER);
            assert_eq!(root.biggest_free, root.largest_free_chunk);
        }
    }

    #[test]
    fn grows_at_head_with_sized_block() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, false);

        let big = heap.allocate(3 * 4096).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.blocks, 2);
        // ceil((3 * 4096 + headers) / 4096)
        assert_eq!(stats.pages, 1 + 4);

        let mut newest = None;
        heap.for_each_block(|b| {
            newest.get_or_insert(*b);
        });
        assert_eq!(newest.unwrap().pages, 4);

        unsafe { heap.release(big) };
        // without reclaim the block stays
        assert_eq!(heap.stats().blocks, 2);
        heap.verify();
    }

    #[test]
    fn reclaims_empty_blocks_when_configured() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, true);

        let big = heap.allocate(2 * 4096).unwrap();
        assert_eq!(pages.outstanding(), 1 + 3);
        unsafe { heap.release(big) };
        assert_eq!(heap.stats().blocks, 1);
        assert_eq!(pages.outstanding(), 1);

        // the root block is kept even when empty
        let p = heap.allocate(16).unwrap();
        unsafe { heap.release(p) };
        assert_eq!(heap.stats().blocks, 1);
        heap.verify();
    }

    #[test]
    fn out_of_memory_is_reported() {
        let pages = HostPageAlloc::with_budget(1);
        let mut heap = small_heap(&pages, false);
        assert_eq!(heap.allocate(8192), Err(HeapError::OutOfMemory));
        assert!(matches!(heap.allocate(usize::MAX), Err(HeapError::TooLarge(_))));
        // the heap is still usable
        assert!(heap.allocate(32).is_ok());
    }

    #[test]
    fn drop_returns_all_pages() {
        let pages = HostPageAlloc::new();
        {
            let mut heap = small_heap(&pages, false);
            heap.allocate(3 * 4096).unwrap();
            heap.allocate(2 * 4096).unwrap();
            assert!(pages.outstanding() > 1);
        }
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_halts() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, false);
        let a = heap.allocate(48).unwrap();
        let _b = heap.allocate(48).unwrap();
        unsafe {
            heap.release(a);
            heap.release(a);
        }
    }

    #[test]
    #[should_panic(expected = "corruption")]
    fn clobbered_header_halts() {
        let pages = HostPageAlloc::new();
        let mut heap = small_heap(&pages, false);
        let a = heap.allocate(48).unwrap();
        unsafe {
            a.as_ptr().sub(CHUNK_HEADER).cast::<u32>().write(0x1234_5678);
            heap.release(a);
        }
    }

    mod churn {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Alloc(usize),
            Free(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1usize..3000).prop_map(Op::Alloc),
                any::<usize>().prop_map(Op::Free),
            ]
        }

        proptest! {
            #[test]
            fn random_churn_keeps_block_invariants(ops in prop::collection::vec(op(), 1..120)) {
                let pages = HostPageAlloc::new();
                let mut heap = small_heap(&pages, false);
                let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

                for (n, op) in ops.into_iter().enumerate() {
                    match op {
                        Op::Alloc(size) => {
                            let p = heap.allocate(size).unwrap();
                            let tag = (n % 251) as u8;
                            unsafe { p.as_ptr().write_bytes(tag, size) };
                            live.push((p, size, tag));
                        }
                        Op::Free(i) if !live.is_empty() => {
                            let (p, size, tag) = live.swap_remove(i % live.len());
                            // neighbours never scribble over a live payload
                            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                            prop_assert!(bytes.iter().all(|b| *b == tag));
                            unsafe { heap.release(p) };
                        }
                        Op::Free(_) => {}
                    }
                    heap.verify();
                }

                for (p, _, _) in live.drain(..) {
                    unsafe { heap.release(p) };
                }
                let stats = heap.stats();
                prop_assert_eq!(stats.allocated_chunks, 0);
                prop_assert_eq!(stats.free_chunks, stats.blocks);
            }
        }
    }
}
