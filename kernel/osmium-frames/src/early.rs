//! Boot-time page allocator over the raw memory range table.
//!
//! Before the record array exists there is nothing to track allocations
//! with, so the earliest page tables and bookkeeping structures come straight
//! out of the boot loader's range table: each allocation shrinks an
//! `Available` range by one page and hands out the tail. The shrink is
//! recorded in the table itself, which is what later lets
//! [`FrameAllocator::finalize`](crate::FrameAllocator::finalize) walk the
//! leftover ranges without ever seeing an early-allocated page twice.
//!
//! Pages handed out here are never tracked and can never be freed. That is
//! deliberate: everything allocated this early (root page tables, the record
//! window's own backing) lives for the kernel's whole life anyway.

use log::trace;
use osmium_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use osmium_info::boot::{MemoryRange, MemoryRangeKind};

/// Ranges at or below this base stay untouched. Real-mode firmware data and
/// the BIOS data area live down there.
const LOW_RESERVATION_LIMIT: u64 = 0x10000;

const PAGE_BYTES: u64 = 4096;

/// Allocator that carves pages off the tails of the boot memory ranges.
///
/// Borrows the range table mutably for its whole life; the shrunk sizes are
/// the allocator's only state besides a scan cursor.
pub struct EarlyAllocator<'r> {
    ranges: &'r mut [MemoryRange],
    cursor: usize,
}

impl<'r> EarlyAllocator<'r> {
    /// Wraps the boot range table.
    #[must_use]
    pub const fn new(ranges: &'r mut [MemoryRange]) -> Self {
        Self { ranges, cursor: 0 }
    }

    /// Allocates one 4 KiB page from the tail of the first eligible range.
    ///
    /// Eligible means `Available`, based above the low-memory reservation
    /// and still at least one page long. Returns `None` once every range is
    /// drained; callers treat that as fatal, nothing can recover from
    /// running out of memory during bring-up.
    pub fn allocate(&mut self) -> Option<PhysicalPage<Size4K>> {
        while self.cursor < self.ranges.len() {
            let range = &mut self.ranges[self.cursor];
            if range.kind == MemoryRangeKind::Available
                && range.base > LOW_RESERVATION_LIMIT
                && range.size >= PAGE_BYTES
            {
                range.size -= PAGE_BYTES;
                let addr = PhysicalAddress::new(range.base + range.size);
                trace!("early page allocated at {addr}");
                return Some(addr.page());
            }
            self.cursor += 1;
        }
        None
    }

    /// Number of ranges in the table.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True when the table has no ranges at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Copy of the range at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub const fn range(&self, index: usize) -> MemoryRange {
        self.ranges[index]
    }

    /// Takes one page off the tail of the range at `index`, whatever its
    /// kind. This is the finalization walk's primitive: unlike
    /// [`allocate`](Self::allocate) it also drains reserved, firmware and
    /// low-memory ranges, because every leftover page needs a record.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub const fn take_last_page(&mut self, index: usize) -> Option<PhysicalPage<Size4K>> {
        let range = &mut self.ranges[index];
        if range.size < PAGE_BYTES {
            return None;
        }
        range.size -= PAGE_BYTES;
        Some(PhysicalAddress::new(range.base + range.size).page())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> [MemoryRange; 4] {
        [
            MemoryRange::new(MemoryRangeKind::Available, 0x1000, 0x4000),
            MemoryRange::new(MemoryRangeKind::Reserved, 0x9_0000, 0x1000),
            MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x3000),
            MemoryRange::new(MemoryRangeKind::Available, 0x20_0000, 0x1000),
        ]
    }

    #[test]
    fn allocates_from_the_tail_downwards() {
        let mut ranges = table();
        let mut early = EarlyAllocator::new(&mut ranges);

        let first = early.allocate().unwrap();
        let second = early.allocate().unwrap();
        assert_eq!(first.base().as_u64(), 0x10_2000);
        assert_eq!(second.base().as_u64(), 0x10_1000);
        assert_eq!(ranges[2].size, 0x1000);
    }

    #[test]
    fn skips_low_memory_and_non_available_ranges() {
        let mut ranges = table();
        let mut early = EarlyAllocator::new(&mut ranges);

        for _ in 0..4 {
            let page = early.allocate().unwrap();
            assert!(page.base().as_u64() >= 0x10_0000);
        }
        assert!(early.allocate().is_none());
        assert_eq!(ranges[0].size, 0x4000);
        assert_eq!(ranges[1].size, 0x1000);
    }

    #[test]
    fn single_page_range_is_still_eligible() {
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x20_0000, 0x1000)];
        let mut early = EarlyAllocator::new(&mut ranges);

        assert_eq!(early.allocate().unwrap().base().as_u64(), 0x20_0000);
        assert!(early.allocate().is_none());
        assert_eq!(ranges[0].size, 0);
    }

    #[test]
    fn take_last_page_ignores_kind_and_base() {
        let mut ranges = table();
        let mut early = EarlyAllocator::new(&mut ranges);

        assert_eq!(early.take_last_page(0).unwrap().base().as_u64(), 0x4000);
        assert_eq!(early.take_last_page(1).unwrap().base().as_u64(), 0x9_0000);
        assert!(early.take_last_page(1).is_none());
    }
}
