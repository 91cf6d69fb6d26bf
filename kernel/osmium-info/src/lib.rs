//! # Kernel Memory Layout and Boot Interface
//!
//! This crate is the single source of truth for the kernel's virtual address
//! space plan and for the loader-to-kernel handoff ABI consumed by the
//! virtual-memory subsystem. It carries no code of its own beyond constants,
//! `#[repr(C)]` data definitions, and compile-time layout checks, so every
//! other crate can depend on it without dragging in behavior.
//!
//! ## Address space plan
//!
//! The kernel owns the top 2 GiB of the canonical higher half, with two
//! reserved windows carved out around it:
//!
//! ```text
//! 0xFFFF_FFFF_FFFF_FFFF ┌────────────────────────────────┐
//!                       │  temporary mapping window      │ top 2 MiB;
//! TEMP_WINDOW_BASE      ├────────────────────────────────┤ 0xFFFF_FFFF_FFE0_0000
//!                       │  kernel image, heap, stacks    │
//! KERNEL_BASE           ├────────────────────────────────┤ 0xFFFF_FFFF_8000_0000
//!                       │  physical page record array    │ 4 GiB, demand paged
//! PAGE_RECORDS_BASE     ├────────────────────────────────┤ 0xFFFF_FFFE_8000_0000
//!                       │  (unreserved higher half)      │
//! 0xFFFF_8000_0000_0000 ├────────────────────────────────┤ canonical boundary
//!                       │  non-canonical hole            │
//! 0x0000_8000_0000_0000 ├────────────────────────────────┤
//!                       │  lower half (unused here)      │
//! 0x0000_0000_0000_0000 └────────────────────────────────┘
//! ```
//!
//! ## Loader guarantees
//!
//! The loader must establish the following before handing over control:
//!
//! 1. The kernel image is mapped inside the top 2 GiB on 2 GiB alignment.
//! 2. The very top level-1 page table is self-mapped through its own last
//!    entry, so the table that serves the temporary mapping window is itself
//!    reachable at [`layout::TEMP_TABLE_VA`].
//! 3. The memory range table named by the handoff is mapped and passes into
//!    the kernel's exclusive ownership at the point of transfer.
//!
//! The [`boot`] module defines the handoff records themselves; [`layout`]
//! defines the constants above together with compile-time consistency
//! checks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod layout;
