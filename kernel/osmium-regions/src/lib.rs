//! Bookkeeping for live spans of the virtual address space.
//!
//! Every mapped span of kernel address space is described by a region. The
//! page-fault path needs to answer "which region owns this address", and
//! allocation needs to answer "does this span collide with anything", both
//! quickly and both before any allocator is guaranteed to work. A red-black
//! tree keyed by range overlap answers both with the same comparison: probe
//! with a single byte to find an owner, probe with the full span to find a
//! collision.
//!
//! The tree is intrusive. [`RegionNode`]s live wherever the caller puts
//! them, in static storage during bring-up and on the kernel heap later,
//! and the tree only wires them together. That keeps the tree itself
//! allocation-free, which matters because it must already work while the
//! allocators it serves are still being constructed.
//!
//! Lookups are split into [`RegionTree::locate`] and [`RegionTree::insert`]
//! so the caller can build the node for the hole the lookup found. The
//! insertion point is pinned to the tree shape at lookup time; inserting
//! through a stale point is a logic error and panics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod key;
mod tree;

pub use key::RangeKey;
pub use tree::{Direction, InsertionPoint, RegionNode, RegionTree};
