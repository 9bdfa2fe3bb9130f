//! # Identifier and Stack Limits

/// Process identifiers are handed out from `1..MAX_PROCESS_COUNT` and wrap.
pub const MAX_PROCESS_COUNT: u32 = 1_000_000;

/// Thread identifiers are handed out from `1..MAX_THREAD_COUNT` and wrap.
pub const MAX_THREAD_COUNT: u32 = 1_000_000;

/// Number of pages backing every kernel thread stack.
#[cfg(debug_assertions)]
pub const KERNEL_STACK_PAGES: usize = 8;

/// Number of pages backing every kernel thread stack.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_PAGES: usize = 4;

const _: () = {
    assert!(MAX_PROCESS_COUNT > 1);
    assert!(MAX_THREAD_COUNT > 1);
    assert!(KERNEL_STACK_PAGES > 0);
};
