//! # Page Tables and the MMU
//!
//! The model of the x86-64 four-level page-table radix tree, the walk
//! operations over it, and the temporary-mapping protocol that lets the
//! kernel edit tables it has no permanent window onto.
//!
//! ## The walk
//!
//! A canonical virtual address decomposes into four 9-bit indices and a
//! 12-bit offset. Each index selects an entry in one 4 KiB table; each entry
//! points at the next table down, until a leaf entry points at the mapped
//! frame:
//!
//! ```text
//! 63        48 47      39 38      30 29      21 20      12 11         0
//! +-----------+----------+----------+----------+----------+-----------+
//! | sign ext. | L4 index | L3 index | L2 index | L1 index |  offset   |
//! +-----------+----------+----------+----------+----------+-----------+
//!                  |          |          |          |
//!                  v          v          v          v
//!       CR3 -> [L4 table] [L3 table] [L2 table] [L1 table] -> frame
//! ```
//!
//! A leaf can sit one level early: an L2 entry with the `large` bit set maps
//! a full 2 MiB frame and has no L1 table beneath it.
//!
//! ## Seams
//!
//! [`AddressSpace`] performs the walk but owns nothing except the root
//! table's physical page. Everything environmental comes in through two
//! traits:
//!
//! * [`FrameAlloc`] supplies zeroed-on-demand 4 KiB frames for missing
//!   intermediate tables.
//! * [`PhysMapper`] turns a physical page into a dereferenceable pointer for
//!   the duration of one closure. On hardware that is the temporary-mapping
//!   window ([`TempSlots`] + [`TempMapper`]); under host tests it is plain
//!   simulated memory.
//!
//! Keeping both as traits makes every walk host-testable: the test suite
//! runs the real `map`/`unmap`/`query` code against boxed frames without
//! ever executing a privileged instruction.
//!
//! ## Temporary mappings
//!
//! The top 2 MiB of the address space is a scratch window served by a single
//! level-1 table that is always mapped (it maps itself through its last
//! entry). [`TempSlots`] hands out 4 KiB slots from that window using a free
//! list threaded through the non-present entries themselves, so acquiring or
//! releasing a slot never re-enters the general map walk. See the module
//! docs in [`temp_slots`] for the entry encoding.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod fault_code;
pub mod page_table;
pub mod temp_slots;

#[cfg(target_arch = "x86_64")]
pub mod mmu;

use core::ptr::NonNull;

use osmium_addresses::{PhysicalPage, Size4K};
use thiserror::Error;

pub use address_space::{AddressSpace, Translation};
pub use fault_code::PageFaultCode;
pub use page_table::{
    ContentClass, ENTRY_ADDRESS_MASK, ENTRY_FLAGS_MASK, L1Index, L2Index, L3Index, L4Index,
    PageSizeClass, PageTable, PageTableEntry, split_indices,
};
pub use temp_slots::{TempMapper, TempSlots};

/// Source of 4 KiB physical frames for the walk.
///
/// `map` pulls one frame per missing intermediate table. The returned frame
/// is not assumed to be zeroed; the walk zeroes it through the mapper before
/// linking it.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// Short-lived access to the bytes of a physical page.
///
/// The contract is strictly bracketed: every pointer obtained from
/// [`map_page`](Self::map_page) is passed back to
/// [`unmap_page`](Self::unmap_page) exactly once, and does not outlive the
/// mapper. The provided `with_*` helpers enforce the pairing; the walk only
/// uses those.
pub trait PhysMapper {
    /// Maps one physical page and returns a pointer to its first byte.
    ///
    /// # Safety
    ///
    /// The caller must pass the pointer to [`unmap_page`](Self::unmap_page)
    /// before requesting enough further mappings to exhaust the mapper, and
    /// must not use it afterwards.
    unsafe fn map_page(&self, page: PhysicalPage<Size4K>, class: ContentClass) -> NonNull<u8>;

    /// Releases a mapping obtained from [`map_page`](Self::map_page).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a `map_page` call on this mapper and must not be
    /// released twice.
    unsafe fn unmap_page(&self, ptr: NonNull<u8>);

    /// Runs `f` over a mapping of `page`, releasing it afterwards.
    ///
    /// # Safety
    ///
    /// `page` must be ordinary memory owned by the caller for the duration
    /// of the call.
    unsafe fn with_page<R>(
        &self,
        page: PhysicalPage<Size4K>,
        class: ContentClass,
        f: impl FnOnce(NonNull<u8>) -> R,
    ) -> R {
        let ptr = unsafe { self.map_page(page, class) };
        let result = f(ptr);
        unsafe { self.unmap_page(ptr) };
        result
    }

    /// Runs `f` over `page` viewed as a page table.
    ///
    /// # Safety
    ///
    /// `page` must hold a page table (or fresh memory about to become one)
    /// exclusively owned by the caller for the duration of the call.
    unsafe fn with_table<R>(
        &self,
        page: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut PageTable) -> R,
    ) -> R {
        unsafe {
            self.with_page(page, ContentClass::ReadWriteData, |ptr| {
                f(ptr.cast::<PageTable>().as_mut())
            })
        }
    }
}

/// Why a walk operation could not complete.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum MapError {
    /// The frame source ran dry while a table was needed.
    #[error("no physical frame available for a page table")]
    FrameExhausted,
    /// The virtual address has no live translation.
    #[error("virtual address is not mapped")]
    NotMapped,
    /// Address not aligned to the requested page size.
    #[error("address is not aligned to the page size")]
    NotAligned,
    /// The walk ran into a larger leaf than the operation supports.
    #[error("translation ends in an unsupported large leaf")]
    LargeLeaf,
}

#[cfg(test)]
pub(crate) mod sim {
    //! Simulated physical memory for walk tests. Frame `i` lives at
    //! physical address `i * 4096`.

    use core::cell::UnsafeCell;
    use core::ptr::NonNull;

    use osmium_addresses::{PhysicalAddress, PhysicalPage, Size4K};

    use super::{ContentClass, FrameAlloc, PhysMapper};

    #[repr(align(4096))]
    struct SimFrame(UnsafeCell<[u8; 4096]>);

    pub struct SimRam {
        frames: Vec<Box<SimFrame>>,
    }

    impl SimRam {
        pub fn new(frame_count: usize) -> Self {
            let mut frames = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                frames.push(Box::new(SimFrame(UnsafeCell::new([0; 4096]))));
            }
            Self { frames }
        }

        pub fn frame_ptr(&self, page: PhysicalPage<Size4K>) -> NonNull<u8> {
            let index = (page.base().as_u64() >> 12) as usize;
            let frame = &self.frames[index];
            NonNull::new(frame.0.get().cast::<u8>()).unwrap()
        }
    }

    impl PhysMapper for SimRam {
        unsafe fn map_page(&self, page: PhysicalPage<Size4K>, _class: ContentClass) -> NonNull<u8> {
            self.frame_ptr(page)
        }

        unsafe fn unmap_page(&self, _ptr: NonNull<u8>) {}
    }

    /// Hands out simulated frames in order, starting at `first * 4096`.
    pub struct BumpAlloc {
        next: u64,
        limit: u64,
    }

    impl BumpAlloc {
        pub fn new(first: u64, count: u64) -> Self {
            Self {
                next: first,
                limit: first + count,
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.limit {
                return None;
            }
            let page = PhysicalPage::from_addr(PhysicalAddress::new(self.next << 12));
            self.next += 1;
            Some(page)
        }
    }
}
