//! # Physical Page Frame Allocator
//!
//! Tracks every 4 KiB page of physical memory with an 8-byte
//! [`PageRecord`] and keeps the free pages on intrusive per-tier stacks:
//! the stack links are stored inside the records of the free pages
//! themselves, so the allocator's own footprint is the record array and
//! three head indices.
//!
//! A page record moves through three states:
//!
//! ```text
//!                 set_present          alloc / pop
//!   absent  ---------------------> free ---------> allocated (refs = 1)
//!   (zero)                          ^                  |   ^
//!                                   |                  v   |
//!                                   +----- free() -- refs reaches 0
//!                                                  (inc_ref / dec_ref
//!                                                   move refs up and down)
//! ```
//!
//! Allocation pops the head of a tier stack; freeing drops a reference and
//! pushes the page back once nothing references it anymore. Pages shared by
//! several mappings (the zero page above all) stay allocated until the last
//! reference goes away. A page's tier is a pure function of its physical
//! address and is recomputed on every push, never cached in the record.
//!
//! ## Bootstrapping
//!
//! The record array is demand-paged, and the allocator that backs demand
//! paging is this one. Two mechanisms break the cycle:
//!
//! * Before the virtual memory layer runs, an [`EarlyAllocator`] carves
//!   pages directly out of the boot range table ([`early`] module). Those
//!   pages are never tracked.
//! * Record writes that may touch a not-yet-backed record page announce the
//!   slot address through the [`RecordPager`] seam first. The virtual
//!   memory layer resolves the mapping with the same routine its fault
//!   handler uses, just without a hardware fault. Operations on pages that
//!   went through [`alloc`](FrameAllocator::alloc) or
//!   [`free`](FrameAllocator::free) before need no preparation: their
//!   records were written at allocation time, so their record pages exist.
//!
//! [`FrameAllocator::finalize`] hands every leftover boot-range page to the
//! record array and retires the early allocator for good.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod early;
mod records;
mod stacks;

pub use early::EarlyAllocator;
pub use records::{PageRecord, PageRecords, RecordFlags};
pub use stacks::{EMPTY, FrameStacks};

use log::info;
use osmium_addresses::{PageIndex, PhysicalPage, Size4K, Tier, TierRequest, VirtualAddress};
use osmium_info::boot::MemoryRangeKind;

/// Resolves demand-paged record slots before the allocator writes to them.
///
/// [`prepare`](Self::prepare) receives the allocator itself back, because
/// materializing a record page takes a fresh frame and the only place one
/// can come from is this very allocator. The nesting is bounded: the nested
/// allocation only pops a stack or falls back to the early allocator,
/// neither of which prepares records.
pub trait RecordPager {
    /// Makes the record slot at `slot` writable.
    fn prepare(&mut self, frames: &mut FrameAllocator<'_>, slot: VirtualAddress);
}

/// Pager for record arrays that sit in ordinary writable memory, where
/// every slot is backed from the start. Used by host tests and by kernels
/// before paging is the record window's problem.
pub struct DirectRecords;

impl RecordPager for DirectRecords {
    fn prepare(&mut self, _frames: &mut FrameAllocator<'_>, _slot: VirtualAddress) {}
}

/// The page frame allocator: record array, per-tier free stacks, and the
/// early allocator until [`finalize`](Self::finalize) retires it.
pub struct FrameAllocator<'r> {
    records: PageRecords,
    stacks: FrameStacks,
    early: Option<EarlyAllocator<'r>>,
}

impl<'r> FrameAllocator<'r> {
    /// Creates the allocator in its bring-up configuration: empty stacks,
    /// an untouched record view, and a live early allocator.
    #[must_use]
    pub const fn new(records: PageRecords, early: EarlyAllocator<'r>) -> Self {
        Self {
            records,
            stacks: FrameStacks::new(),
            early: Some(early),
        }
    }

    /// Allocates one 4 KiB page, refcount 1.
    ///
    /// Pops the first non-empty stack among the request's candidate tiers;
    /// [`TierRequest::Any`] drains high memory before touching the ranges
    /// 32-bit devices depend on. While the early allocator is still live,
    /// empty stacks fall back to it (and the page comes back untracked).
    /// `None` means out of memory, which no caller in the kernel can
    /// recover from.
    pub fn alloc(&mut self, request: TierRequest) -> Option<PhysicalPage<Size4K>> {
        for &tier in request.candidates() {
            if let Some(index) = self.pop(tier) {
                return Some(index.page());
            }
        }
        self.early.as_mut().and_then(EarlyAllocator::allocate)
    }

    /// Releases one reference to the page, pushing it back onto its tier's
    /// free stack once no references remain.
    ///
    /// Pages without a present record are ignored: device windows and
    /// firmware ranges look like pages but there is no RAM to reclaim.
    /// Freeing an already-free page is likewise ignored.
    pub fn free(&mut self, page: PhysicalPage<Size4K>) {
        let index = PageIndex::of_page(page);
        if !self.records.get(index).present() {
            return;
        }
        if self.dec_ref(page) == Some(0) {
            self.push(index);
        }
    }

    /// Takes another reference to an allocated page. Returns the new
    /// reference count, or `None` if the page is not allocated.
    pub fn inc_ref(&mut self, page: PhysicalPage<Size4K>) -> Option<i32> {
        let index = PageIndex::of_page(page);
        let record = self.records.get(index);
        if !record.allocated() {
            return None;
        }
        let refs = record.refs() + 1;
        self.records.set(index, record.with_allocated_refs(refs));
        Some(refs)
    }

    /// Drops a reference to an allocated page. Returns the new reference
    /// count, or `None` if the page is not allocated. The count never goes
    /// below zero; the page stays allocated even at zero, pushing it back
    /// is [`free`](Self::free)'s business.
    pub fn dec_ref(&mut self, page: PhysicalPage<Size4K>) -> Option<i32> {
        let index = PageIndex::of_page(page);
        let record = self.records.get(index);
        if !record.allocated() {
            return None;
        }
        let refs = if record.refs() > 0 {
            record.refs() - 1
        } else {
            record.refs()
        };
        self.records.set(index, record.with_allocated_refs(refs));
        Some(refs)
    }

    /// Marks physical RAM as existing at `page`, counting it into its
    /// tier's total on the first call. Idempotent.
    pub fn set_present<P: RecordPager>(&mut self, page: PhysicalPage<Size4K>, pager: &mut P) {
        let index = PageIndex::of_page(page);
        let slot = self.records.address_of(index);
        pager.prepare(self, slot);
        let record = self.records.get(index);
        if record.present() {
            return;
        }
        self.stacks.count_present(Tier::of(index.address()));
        self.records.set(index, record.with_present());
    }

    /// Marks `page` allocated with reference count 1, whatever its record
    /// said before.
    pub fn set_allocated<P: RecordPager>(&mut self, page: PhysicalPage<Size4K>, pager: &mut P) {
        let index = PageIndex::of_page(page);
        let slot = self.records.address_of(index);
        pager.prepare(self, slot);
        let record = self.records.get(index);
        self.records.set(index, record.with_allocated_refs(1));
    }

    /// Marks `page`'s record free with an empty link. This only rewrites
    /// the record; putting the page on a stack is [`free`](Self::free)'s
    /// job.
    pub fn set_free<P: RecordPager>(&mut self, page: PhysicalPage<Size4K>, pager: &mut P) {
        let index = PageIndex::of_page(page);
        let slot = self.records.address_of(index);
        pager.prepare(self, slot);
        let record = self.records.get(index);
        self.records.set(index, record.with_free_link(EMPTY));
    }

    /// Transfers every page still left in the boot range table into the
    /// record array and retires the early allocator permanently.
    ///
    /// Each leftover page is first marked allocated with one reference,
    /// then dispatched by its range kind: `Reserved` and `System` become
    /// present and stay allocated forever, `Available` pages are freed onto
    /// their tier stacks, and `Firmware`, `Mmio` and `Unusable` pages stay
    /// not-present so [`free`](Self::free) will never touch them.
    ///
    /// Does nothing when called again.
    pub fn finalize<P: RecordPager>(&mut self, pager: &mut P) {
        let range_count = match &self.early {
            Some(early) => early.len(),
            None => return,
        };
        info!("finalizing early page allocator");

        for range in 0..range_count {
            let Some(early) = self.early.as_ref() else {
                break;
            };
            let kind = early.range(range).kind;
            // The size is re-read through the table on every page: resolving
            // a record mapping can nest an early allocation that shrinks the
            // very range being walked. Such pages never reach this loop and
            // stay untracked, like every other early allocation.
            while let Some(page) = self.early.as_mut().and_then(|e| e.take_last_page(range)) {
                self.adopt_leftover(page, kind, pager);
            }
        }
        self.early = None;

        for tier in [Tier::Low, Tier::Conventional, Tier::High] {
            info!(
                "{} memory: {} of {} pages free",
                tier,
                self.stacks.free_pages(tier),
                self.stacks.total_pages(tier)
            );
        }
    }

    /// True once [`finalize`](Self::finalize) has retired the early
    /// allocator.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.early.is_none()
    }

    /// Number of pages currently on the tier's free stack.
    #[must_use]
    pub const fn free_pages(&self, tier: Tier) -> u64 {
        self.stacks.free_pages(tier)
    }

    /// Number of present pages in the tier, free or allocated.
    #[must_use]
    pub const fn total_pages(&self, tier: Tier) -> u64 {
        self.stacks.total_pages(tier)
    }

    /// Marked allocated with one reference first, so the available case
    /// reduces to an ordinary [`free`](Self::free).
    fn adopt_leftover<P: RecordPager>(
        &mut self,
        page: PhysicalPage<Size4K>,
        kind: MemoryRangeKind,
        pager: &mut P,
    ) {
        self.set_allocated(page, pager);
        match kind {
            MemoryRangeKind::Reserved | MemoryRangeKind::System => self.set_present(page, pager),
            MemoryRangeKind::Available => {
                self.set_present(page, pager);
                self.free(page);
            }
            MemoryRangeKind::Unusable | MemoryRangeKind::Firmware | MemoryRangeKind::Mmio => {}
        }
    }

    /// Pops the head of the tier's stack and marks it allocated.
    ///
    /// No record preparation: a page can only be on a stack if its record
    /// was written when it was pushed, so the record page exists.
    #[allow(clippy::cast_sign_loss)]
    fn pop(&mut self, tier: Tier) -> Option<PageIndex> {
        let head = self.stacks.head(tier);
        if head < 0 {
            return None;
        }
        let index = PageIndex::new(head as u64);
        let record = self.records.get(index);
        debug_assert!(record.present() && !record.allocated());
        self.stacks.set_head(tier, record.next_free());
        self.records.set(index, record.with_allocated_refs(1));
        self.stacks.count_pop(tier);
        Some(index)
    }

    /// Links the page in as the new head of its tier's stack. The tier is
    /// recomputed from the physical address here, never read from anywhere.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn push(&mut self, index: PageIndex) {
        debug_assert!(index.as_u64() < i32::MAX as u64);
        let tier = Tier::of(index.address());
        let record = self.records.get(index).with_free_link(self.stacks.head(tier));
        self.records.set(index, record);
        self.stacks.set_head(tier, index.as_u64() as i32);
        self.stacks.count_push(tier);
    }
}

impl osmium_vmem::FrameAlloc for FrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc(TierRequest::Any)
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use osmium_addresses::PhysicalAddress;
    use osmium_info::boot::MemoryRange;

    use super::*;

    /// Record slots covering physical memory up to just past 4 GiB.
    const SLOTS: usize = 0x10_0400;

    fn record_arena() -> (Vec<PageRecord>, PageRecords) {
        let mut storage = vec![PageRecord::absent(); SLOTS];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        let view = unsafe { PageRecords::from_raw(base, SLOTS) };
        (storage, view)
    }

    fn page_at(addr: u64) -> PhysicalPage<Size4K> {
        PhysicalAddress::new(addr).page()
    }

    fn mixed_map() -> [MemoryRange; 5] {
        [
            MemoryRange::new(MemoryRangeKind::Reserved, 0x8000, 0x1000),
            MemoryRange::new(MemoryRangeKind::System, 0x9_f000, 0x1000),
            MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x3000),
            MemoryRange::new(MemoryRangeKind::Firmware, 0x20_0000, 0x1000),
            MemoryRange::new(MemoryRangeKind::Available, 0x1_0000_0000, 0x2000),
        ]
    }

    #[test]
    fn finalize_classifies_leftover_ranges() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        frames.finalize(&mut DirectRecords);
        assert!(frames.is_finalized());

        let reserved = frames.records.get(PageIndex::of_address(PhysicalAddress::new(0x8000)));
        assert!(reserved.present() && reserved.allocated());
        assert_eq!(reserved.refs(), 1);

        let system = frames.records.get(PageIndex::of_address(PhysicalAddress::new(0x9_f000)));
        assert!(system.present() && system.allocated());

        let firmware = frames.records.get(PageIndex::of_address(PhysicalAddress::new(0x20_0000)));
        assert!(!firmware.present() && firmware.allocated());

        assert_eq!(frames.free_pages(Tier::Low), 0);
        assert_eq!(frames.total_pages(Tier::Low), 2);
        assert_eq!(frames.free_pages(Tier::Conventional), 3);
        assert_eq!(frames.total_pages(Tier::Conventional), 3);
        assert_eq!(frames.free_pages(Tier::High), 2);
        assert_eq!(frames.total_pages(Tier::High), 2);
    }

    #[test]
    fn finalize_twice_changes_nothing() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        frames.finalize(&mut DirectRecords);
        frames.finalize(&mut DirectRecords);
        assert_eq!(frames.free_pages(Tier::Conventional), 3);
        assert_eq!(frames.total_pages(Tier::Conventional), 3);
    }

    #[test]
    fn alloc_drains_high_memory_first() {
        let (_storage, records) = record_arena();
        let mut ranges = [
            MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x1000),
            MemoryRange::new(MemoryRangeKind::Available, 0x1_0000_0000, 0x1000),
        ];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        let first = frames.alloc(TierRequest::Any).unwrap();
        assert_eq!(first.base().as_u64(), 0x1_0000_0000);
        let second = frames.alloc(TierRequest::Any).unwrap();
        assert_eq!(second.base().as_u64(), 0x10_0000);
        assert!(frames.alloc(TierRequest::Any).is_none());

        let record = frames.records.get(PageIndex::of_page(first));
        assert!(record.allocated());
        assert_eq!(record.refs(), 1);
    }

    #[test]
    fn alloc_pops_in_reverse_push_order() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x3000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        // Finalization walks the range from its tail, so the lowest page is
        // pushed last and pops first.
        for expected in [0x10_0000u64, 0x10_1000, 0x10_2000] {
            let page = frames.alloc(TierRequest::Conventional).unwrap();
            assert_eq!(page.base().as_u64(), expected);
        }
    }

    #[test]
    fn tier_requests_are_not_served_from_other_tiers() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x1_0000_0000, 0x1000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        assert!(frames.alloc(TierRequest::Low).is_none());
        assert!(frames.alloc(TierRequest::Conventional).is_none());
        assert!(frames.alloc(TierRequest::High).is_some());
    }

    #[test]
    fn page_zero_is_allocatable() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0, 0x1000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);
        assert_eq!(frames.free_pages(Tier::Low), 1);

        let page = frames.alloc(TierRequest::Low).unwrap();
        assert_eq!(page.base().as_u64(), 0);
        assert!(frames.alloc(TierRequest::Low).is_none());
    }

    #[test]
    fn free_returns_the_page_once_references_run_out() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x2000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        let page = frames.alloc(TierRequest::Conventional).unwrap();
        assert_eq!(frames.free_pages(Tier::Conventional), 1);
        assert_eq!(frames.inc_ref(page), Some(2));

        frames.free(page);
        assert_eq!(frames.free_pages(Tier::Conventional), 1);
        assert!(frames.records.get(PageIndex::of_page(page)).allocated());

        frames.free(page);
        assert_eq!(frames.free_pages(Tier::Conventional), 2);
        assert!(!frames.records.get(PageIndex::of_page(page)).allocated());

        // The freed page is the new stack head.
        let again = frames.alloc(TierRequest::Conventional).unwrap();
        assert_eq!(again.base(), page.base());
    }

    #[test]
    fn free_ignores_pages_without_a_present_record() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        // Firmware page: record exists but is not present.
        frames.free(page_at(0x20_0000));
        // Never-walked page: record is still all zero.
        frames.free(page_at(0x4000_0000));

        assert_eq!(frames.free_pages(Tier::Low), 0);
        assert_eq!(frames.free_pages(Tier::Conventional), 3);
        assert_eq!(frames.free_pages(Tier::High), 2);
    }

    #[test]
    fn double_free_is_ignored() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x2000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        let page = frames.alloc(TierRequest::Conventional).unwrap();
        frames.free(page);
        assert_eq!(frames.free_pages(Tier::Conventional), 2);
        frames.free(page);
        assert_eq!(frames.free_pages(Tier::Conventional), 2);
    }

    #[test]
    fn early_fallback_serves_allocations_before_finalize() {
        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x10_0000, 0x2000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        let page = frames.alloc(TierRequest::Any).unwrap();
        assert_eq!(page.base().as_u64(), 0x10_1000);
        // Early pages are untracked.
        assert!(!frames.records.get(PageIndex::of_page(page)).present());
        assert!(!frames.is_finalized());
    }

    #[test]
    fn refcounts_require_an_allocated_record() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        let page = page_at(0x10_0000);
        assert_eq!(frames.inc_ref(page), None);
        assert_eq!(frames.dec_ref(page), None);

        frames.set_allocated(page, &mut DirectRecords);
        assert_eq!(frames.inc_ref(page), Some(2));
        assert_eq!(frames.dec_ref(page), Some(1));
        assert_eq!(frames.dec_ref(page), Some(0));
        assert_eq!(frames.dec_ref(page), Some(0));
    }

    #[test]
    fn set_free_marks_without_pushing() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        let page = page_at(0x10_0000);
        frames.set_allocated(page, &mut DirectRecords);
        frames.set_present(page, &mut DirectRecords);
        frames.set_free(page, &mut DirectRecords);

        let record = frames.records.get(PageIndex::of_page(page));
        assert!(record.present());
        assert!(!record.allocated());
        assert_eq!(record.next_free(), EMPTY);
        assert_eq!(frames.free_pages(Tier::Conventional), 0);
    }

    #[test]
    fn set_present_counts_each_page_once() {
        let (_storage, records) = record_arena();
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        let page = page_at(0x10_0000);
        frames.set_present(page, &mut DirectRecords);
        frames.set_present(page, &mut DirectRecords);
        assert_eq!(frames.total_pages(Tier::Conventional), 1);
    }

    struct SlotSpy(Vec<u64>);

    impl RecordPager for SlotSpy {
        fn prepare(&mut self, _frames: &mut FrameAllocator<'_>, slot: VirtualAddress) {
            self.0.push(slot.as_u64());
        }
    }

    #[test]
    fn record_writes_announce_their_slot_first() {
        let (_storage, records) = record_arena();
        let expected = records.address_of(PageIndex::of_address(PhysicalAddress::new(0x10_0000)));
        let mut ranges = mixed_map();
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));

        let mut spy = SlotSpy(Vec::new());
        let page = page_at(0x10_0000);
        frames.set_allocated(page, &mut spy);
        frames.set_present(page, &mut spy);
        frames.set_free(page, &mut spy);

        assert_eq!(spy.0, vec![expected.as_u64(); 3]);
    }

    #[test]
    fn frame_alloc_seam_pops_pages() {
        use osmium_vmem::FrameAlloc;

        let (_storage, records) = record_arena();
        let mut ranges = [MemoryRange::new(MemoryRangeKind::Available, 0x1_0000_0000, 0x1000)];
        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(&mut ranges));
        frames.finalize(&mut DirectRecords);

        let page = frames.alloc_4k().unwrap();
        assert_eq!(page.base().as_u64(), 0x1_0000_0000);
    }
}
