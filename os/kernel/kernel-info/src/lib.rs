//! # Kernel Configuration
//!
//! Authoritative source for the layout and sizing constants shared by the
//! memory, heap and process subsystems.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Address-space boundaries for user and kernel regions, page size, and the
//! heap growth parameters:
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │      Null Guard Page            │
//! FIRST_USER_ADDRESS    ├─────────────────────────────────┤ 0x0000_0000_0000_1000
//!                       │         User Space              │
//! LAST_USER_ADDRESS     ├─────────────────────────────────┤ 0x0000_7fff_ffff_ffff
//!                       │   Non-canonical Hole            │
//! FIRST_KERNEL_ADDRESS  ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │        Kernel Space             │
//! LAST_KERNEL_ADDRESS   └─────────────────────────────────┘ 0xffff_ffff_ffff_ffff
//! ```
//!
//! ### Limits ([`limits`])
//! Identifier ranges for processes and threads and the per-thread kernel
//! stack size.
//!
//! ### Error Numbers ([`errno`])
//! The negative error codes surfaced at the system call boundary.
//!
//! ### Runtime Configuration ([`config`])
//! Injectable configuration structs whose `Default` implementations are
//! derived from the compile-time constants, so that tests can build
//! independent subsystem instances with small limits.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod limits;
pub mod memory;

pub use config::{AddressLayout, HeapConfig, KernelConfig};
