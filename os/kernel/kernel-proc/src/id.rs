//! Process and thread identifiers.

use core::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u32);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(u32);

macro_rules! id_impls {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_impls!(ProcessId, "pid:");
id_impls!(ThreadId, "tid:");

/// Cyclic identifier source.
///
/// Hands out `1..limit` in order and starts over at 1 once the counter
/// wraps. Values still in use are skipped.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
    limit: u32,
}

impl IdAllocator {
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self { next: 1, limit }
    }

    /// The next value for which `in_use` is false, or `None` once every
    /// value is taken.
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        for _ in 1..self.limit {
            let candidate = self.next;
            self.next = if self.next + 1 >= self.limit {
                1
            } else {
                self.next + 1
            };
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
