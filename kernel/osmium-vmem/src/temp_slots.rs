//! The temporary-mapping window.
//!
//! Editing a page table requires a virtual mapping of it, and creating a
//! mapping requires editing a page table. The window breaks the cycle: one
//! level-1 table is always mapped (it maps itself through its entry 511, at
//! [`TEMP_TABLE_VA`](osmium_info::layout::TEMP_TABLE_VA)), and its other 511
//! entries serve the top 2 MiB of the address space as short-lived scratch
//! slots:
//!
//! ```text
//! window base                                             table self-map
//! v                                                        v
//! +--------+--------+--------+--     --+--------+----------+
//! | slot 0 | slot 1 | slot 2 |   ...   | slot510| slot 511 |
//! +--------+--------+--------+--     --+--------+----------+
//! each slot: 4 KiB of virtual space, one L1 entry
//! ```
//!
//! The free list lives *inside the non-present entries themselves*: a free
//! entry holds `next_index << 1`, so bit 0 (`present`) stays clear and the
//! hardware can never mistake a link for a live translation. The list end is
//! `-1`, encoded through the same shift (`0xffff_ffff_ffff_fffe`, bit 0
//! still clear). Acquire and release are a handful of entry reads and
//! writes; neither ever re-enters the general map walk, which is what makes
//! the walk free to use slots for its own table edits.

use core::cell::Cell;
use core::ptr::NonNull;

use osmium_addresses::{PhysicalPage, Size4K, VirtualAddress};
use osmium_info::layout::TEMP_SLOT_COUNT;
use osmium_sync::IrqGuard;

use crate::PhysMapper;
use crate::page_table::{ContentClass, PageTable, PageTableEntry};

/// Allocator over the temporary-mapping window's level-1 table.
///
/// Constructed empty at compile time so it can live in a `static`; becomes
/// useful after [`adopt`](Self::adopt) hands it the loader's table. All
/// methods take `&self`: the slot state is interrupt-masked interior
/// mutability, usable from fault paths without a guard object threading
/// through every caller.
pub struct TempSlots {
    /// The window's L1 table. In the kernel this points at the fixed
    /// self-mapped address; tests point it at boxed storage.
    table: Cell<*mut PageTable>,
    /// First virtual address served by the window.
    window_base: Cell<u64>,
    /// Head of the in-entry free list, `-1` when empty.
    first_free: Cell<i32>,
}

// Safety: slot state is only touched with interrupts masked on the single
// hardware thread; host tests keep each instance on one thread.
unsafe impl Sync for TempSlots {}

impl TempSlots {
    /// An unadopted window; every acquire fails until [`adopt`](Self::adopt)
    /// runs.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            table: Cell::new(core::ptr::null_mut()),
            window_base: Cell::new(0),
            first_free: Cell::new(-1),
        }
    }

    /// Takes over the loader's window table.
    ///
    /// Scans all 512 entries and free-lists every non-present one. Present
    /// entries (the self-map in slot 511, plus whatever the loader still has
    /// mapped) stay out of the list and are never handed out.
    ///
    /// # Safety
    ///
    /// `table` must point at the live window table, already mapped at a
    /// stable virtual address, and `window_base` must be the first address
    /// the table serves. Call once, before any acquire.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub unsafe fn adopt(&self, table: NonNull<PageTable>, window_base: VirtualAddress) {
        let _masked = IrqGuard::new();
        self.table.set(table.as_ptr());
        self.window_base.set(window_base.as_u64());
        self.first_free.set(-1);

        for index in 0..PageTable::LEN {
            if !self.entry(index).present() {
                self.set_entry(index, PageTableEntry::from_bits(encode_free(self.first_free.get())));
                // This push never lists index 511: a sane loader keeps the
                // self-map present.
                self.first_free.set(index as i32);
            }
        }
        debug_assert!(
            self.entry(TEMP_SLOT_COUNT).present(),
            "window table is missing its self-map"
        );
    }

    /// Maps `page` into a free slot and returns the slot's address.
    ///
    /// Returns `None` when every slot is taken (or the window was never
    /// adopted).
    pub fn acquire(
        &self,
        page: PhysicalPage<Size4K>,
        class: ContentClass,
    ) -> Option<VirtualAddress> {
        let _masked = IrqGuard::new();
        let index = usize::try_from(self.first_free.get()).ok()?;
        self.first_free.set(decode_free(self.entry(index).into_bits()));
        self.set_entry(
            index,
            class.apply(PageTableEntry::new().with_address(page.base())),
        );
        Some(VirtualAddress::new(
            self.window_base.get() + ((index as u64) << 12),
        ))
    }

    /// Unmaps the slot at `va` and returns the page it held.
    ///
    /// The caller invalidates the TLB entry; the slot itself is immediately
    /// reusable ([`TempMapper`] wraps both steps).
    ///
    /// # Panics
    ///
    /// Panics if `va` lies outside the allocatable window or the slot is
    /// already free; both are caller bugs.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn release(&self, va: VirtualAddress) -> PhysicalPage<Size4K> {
        let _masked = IrqGuard::new();
        let base = self.window_base.get();
        // Below-base addresses wrap to a huge offset and fail the same check.
        let index = (va.as_u64().wrapping_sub(base) >> 12) as usize;
        assert!(index < TEMP_SLOT_COUNT, "address outside the temporary window");

        let entry = self.entry(index);
        assert!(entry.present(), "releasing a free temporary slot");

        let page = entry.address().page();
        self.set_entry(index, PageTableEntry::from_bits(encode_free(self.first_free.get())));
        self.first_free.set(index as i32);
        page
    }

    /// Number of slots currently free, by walking the list.
    #[must_use]
    pub fn available(&self) -> usize {
        let _masked = IrqGuard::new();
        let mut count = 0;
        let mut index = self.first_free.get();
        while let Ok(i) = usize::try_from(index) {
            count += 1;
            index = decode_free(self.entry(i).into_bits());
        }
        count
    }

    fn entry(&self, index: usize) -> PageTableEntry {
        // Safety: `adopt` established a valid table pointer; the list is
        // never walked before that because `first_free` starts at -1.
        unsafe { (*self.table.get()).entry(index) }
    }

    fn set_entry(&self, index: usize, entry: PageTableEntry) {
        // Safety: as for `entry`; interrupts are masked by the caller.
        unsafe { (*self.table.get()).set_entry(index, entry) };
    }
}

/// Free-list encoding: the next index shifted left once, so the present bit
/// of the resting entry is always clear. `-1` survives the round trip via
/// sign extension.
const fn encode_free(next: i32) -> u64 {
    ((next as i64) << 1) as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn decode_free(raw: u64) -> i32 {
    ((raw as i64) >> 1) as i32
}

/// [`PhysMapper`] over the temporary window: the hardware-facing mapper the
/// kernel hands to every walk.
pub struct TempMapper<'a> {
    slots: &'a TempSlots,
}

impl<'a> TempMapper<'a> {
    #[must_use]
    pub const fn new(slots: &'a TempSlots) -> Self {
        Self { slots }
    }
}

impl PhysMapper for TempMapper<'_> {
    /// # Panics
    ///
    /// Running out of slots means a walk leaked mappings or recursed beyond
    /// any supported depth; that is fatal.
    unsafe fn map_page(&self, page: PhysicalPage<Size4K>, class: ContentClass) -> NonNull<u8> {
        let Some(va) = self.slots.acquire(page, class) else {
            panic!("out of temporary mapping slots");
        };
        // Window addresses sit at the top of the space; never null.
        unsafe { NonNull::new_unchecked(va.as_u64() as *mut u8) }
    }

    unsafe fn unmap_page(&self, ptr: NonNull<u8>) {
        let va = VirtualAddress::from_nonnull(ptr);
        let _page = self.slots.release(va);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // Safety: the slot was just unmapped; the stale TLB entry must go.
        unsafe {
            crate::mmu::invalidate(va);
        };
    }
}

#[cfg(test)]
mod tests {
    use osmium_addresses::PhysicalAddress;

    use super::*;

    const WINDOW: u64 = 0x5000_0000;

    fn page(index: u64) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(index << 12))
    }

    fn adopted(table: &mut PageTable) -> TempSlots {
        let slots = TempSlots::empty();
        unsafe {
            slots.adopt(NonNull::from(&mut *table), VirtualAddress::new(WINDOW));
        }
        slots
    }

    fn table_with_self_map() -> PageTable {
        let mut table = PageTable::empty();
        table.set_entry(
            511,
            PageTableEntry::table_link(PhysicalAddress::new(0x7000)),
        );
        table
    }

    #[test]
    fn free_link_encoding_round_trips() {
        for next in [-1, 0, 1, 7, 510] {
            let raw = encode_free(next);
            assert_eq!(raw & 1, 0, "present bit must stay clear for {next}");
            assert_eq!(decode_free(raw), next);
        }
    }

    #[test]
    fn unadopted_window_serves_nothing() {
        let slots = TempSlots::empty();
        assert_eq!(slots.available(), 0);
        assert!(slots.acquire(page(3), ContentClass::ReadWriteData).is_none());
    }

    #[test]
    fn adopt_lists_every_non_present_slot() {
        let mut table = table_with_self_map();
        // A loader leftover in slot 5 must also stay out of the list.
        table.set_entry(
            5,
            PageTableEntry::table_link(PhysicalAddress::new(0x9000)),
        );
        let slots = adopted(&mut table);
        assert_eq!(slots.available(), 510);

        let forbidden = [WINDOW + (5 << 12), WINDOW + (511 << 12)];
        let mut handed_out = 0;
        while let Some(va) = slots.acquire(page(100 + handed_out), ContentClass::ReadWriteData) {
            assert!(
                !forbidden.contains(&va.as_u64()),
                "occupied slot handed out at {va}"
            );
            assert!(va.as_u64() >= WINDOW && va.as_u64() < WINDOW + (511 << 12));
            handed_out += 1;
        }
        assert_eq!(handed_out, 510);
        assert_eq!(slots.available(), 0);
    }

    #[test]
    fn acquire_installs_and_release_returns_the_page() {
        let mut table = table_with_self_map();
        let slots = adopted(&mut table);

        let va = slots
            .acquire(page(42), ContentClass::ReadWriteData)
            .unwrap();
        let index = ((va.as_u64() - WINDOW) >> 12) as usize;
        let entry = slots.entry(index);
        assert!(entry.present() && entry.writable() && entry.no_execute());
        assert_eq!(entry.address().as_u64(), 42 << 12);

        let released = slots.release(va);
        assert_eq!(released, page(42));
        assert!(!slots.entry(index).present());

        // LIFO: the slot comes straight back.
        let again = slots.acquire(page(43), ContentClass::ReadOnlyData).unwrap();
        assert_eq!(again, va);
        let entry = slots.entry(index);
        assert!(entry.present() && !entry.writable() && entry.no_execute());
    }

    #[test]
    #[should_panic(expected = "outside the temporary window")]
    fn releasing_the_self_map_slot_panics() {
        let mut table = table_with_self_map();
        let slots = adopted(&mut table);
        let _ = slots.release(VirtualAddress::new(WINDOW + (511 << 12)));
    }

    #[test]
    #[should_panic(expected = "releasing a free temporary slot")]
    fn double_release_panics() {
        let mut table = table_with_self_map();
        let slots = adopted(&mut table);
        let va = slots
            .acquire(page(9), ContentClass::ReadWriteData)
            .unwrap();
        let _ = slots.release(va);
        let _ = slots.release(va);
    }

    #[test]
    fn temp_mapper_brackets_acquire_and_release() {
        let mut table = table_with_self_map();
        let slots = adopted(&mut table);
        let mapper = TempMapper::new(&slots);

        let before = slots.available();
        let ptr = unsafe { mapper.map_page(page(17), ContentClass::ReadWriteData) };
        assert_eq!(
            (ptr.as_ptr() as u64 - WINDOW) % 4096,
            0,
            "mapper must return a slot-aligned window address"
        );
        assert_eq!(slots.available(), before - 1);
        unsafe { mapper.unmap_page(ptr) };
        assert_eq!(slots.available(), before);
    }

    #[test]
    #[should_panic(expected = "out of temporary mapping slots")]
    fn mapper_panics_when_the_window_is_full() {
        let mut table = PageTable::empty();
        for i in 0..PageTable::LEN {
            table.set_entry(
                i,
                PageTableEntry::table_link(PhysicalAddress::new(0x1000)),
            );
        }
        let slots = adopted(&mut table);
        assert_eq!(slots.available(), 0);
        let mapper = TempMapper::new(&slots);
        let _ = unsafe { mapper.map_page(page(1), ContentClass::ReadWriteData) };
    }
}
