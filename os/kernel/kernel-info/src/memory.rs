//! # Memory Layout

/// Size of a single page, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// [`PAGE_SIZE`] as `usize`, for heap arithmetic.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_BYTES: usize = PAGE_SIZE as usize;

/// Lowest address a userspace region may start at.
///
/// The first page stays unmapped so that null dereferences fault.
pub const FIRST_USER_ADDRESS: u64 = PAGE_SIZE;

/// Last (inclusive) address of the userspace range.
pub const LAST_USER_ADDRESS: u64 = 0x0000_7fff_ffff_ffff;

/// First address of the kernel half.
pub const FIRST_KERNEL_ADDRESS: u64 = 0xffff_8000_0000_0000;

/// Last (inclusive) address of the kernel half.
pub const LAST_KERNEL_ADDRESS: u64 = 0xffff_ffff_ffff_ffff;

/// Number of pages reserved for the heap's root block at boot.
pub const KMALLOC_ROOT_PAGES: usize = 128;

/// Minimum number of pages in every heap block allocated after boot.
pub const KMALLOC_BLOCK_PAGES: usize = 32;

/// Rounds `x` up to the next multiple of `a` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Returns whether `x` is a multiple of `a` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(FIRST_USER_ADDRESS >= PAGE_SIZE);
    assert!(LAST_USER_ADDRESS > FIRST_USER_ADDRESS);
    assert!(FIRST_KERNEL_ADDRESS > LAST_USER_ADDRESS);
    assert!(LAST_KERNEL_ADDRESS > FIRST_KERNEL_ADDRESS);
    assert!(KMALLOC_ROOT_PAGES >= KMALLOC_BLOCK_PAGES);
};
