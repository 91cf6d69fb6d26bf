//! Per-page bookkeeping records.
//!
//! One fixed-size record exists for every 4 KiB physical page the machine
//! could populate, laid out as a flat array indexed by [`PageIndex`]. The
//! array lives in a dedicated virtual window and is itself demand-paged: a
//! record page only materializes once the allocator writes to it, so tracking
//! 2 TiB of potential RAM costs real memory proportional to the RAM actually
//! installed.

use core::ptr::NonNull;

use bitfield_struct::bitfield;
use osmium_addresses::{PageIndex, VirtualAddress};
use osmium_info::layout::PAGE_RECORD_BYTES;

/// Flag word of a [`PageRecord`].
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct RecordFlags {
    /// Usable RAM exists at this page's physical location.
    pub present: bool,

    /// The page is currently handed out.
    pub allocated: bool,

    #[bits(30)]
    __: u32,
}

/// Bookkeeping record of one 4 KiB physical page.
///
/// The link word is overloaded by allocation state: while the page sits on a
/// free stack it holds the index of the next free page (`-1` terminates the
/// list), and while the page is allocated it holds the reference count.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct PageRecord {
    flags: RecordFlags,
    link: i32,
}

const _: () = assert!(size_of::<PageRecord>() as u64 == PAGE_RECORD_BYTES);

impl PageRecord {
    /// Record of a page nothing is known about. All zero, which is exactly
    /// what an untouched (freshly zero-filled) record page reads as.
    #[must_use]
    pub const fn absent() -> Self {
        Self {
            flags: RecordFlags::new(),
            link: 0,
        }
    }

    /// Usable RAM exists at this page's physical location.
    #[must_use]
    pub const fn present(self) -> bool {
        self.flags.present()
    }

    /// The page is currently handed out.
    #[must_use]
    pub const fn allocated(self) -> bool {
        self.flags.allocated()
    }

    /// Reference count. Only meaningful while [`allocated`](Self::allocated).
    #[must_use]
    pub const fn refs(self) -> i32 {
        self.link
    }

    /// Index of the next free page, `-1` at the end of the list. Only
    /// meaningful while not [`allocated`](Self::allocated).
    #[must_use]
    pub const fn next_free(self) -> i32 {
        self.link
    }

    /// Same record with the present flag set.
    #[must_use]
    pub const fn with_present(self) -> Self {
        Self {
            flags: self.flags.with_present(true),
            link: self.link,
        }
    }

    /// Same record marked allocated with the given reference count.
    #[must_use]
    pub const fn with_allocated_refs(self, refs: i32) -> Self {
        Self {
            flags: self.flags.with_allocated(true),
            link: refs,
        }
    }

    /// Same record marked free with the given next-free link.
    #[must_use]
    pub const fn with_free_link(self, next: i32) -> Self {
        Self {
            flags: self.flags.with_allocated(false),
            link: next,
        }
    }
}

/// Raw view of the page record array.
///
/// This is a window, not an owner: the storage behind it belongs to the
/// virtual memory layer (the demand-paged record window in the kernel, a
/// plain buffer in tests). Reads and writes go through raw pointers because
/// the kernel window is sparsely backed and a Rust reference to the whole
/// array would claim validity for pages that do not exist yet.
pub struct PageRecords {
    base: NonNull<PageRecord>,
    capacity: usize,
}

// Safety: the window is exclusively owned by its frame allocator; sending
// it moves that ownership whole.
unsafe impl Send for PageRecords {}

impl PageRecords {
    /// Creates a view of `capacity` records starting at `base`.
    ///
    /// # Safety
    ///
    /// Every record slot that is actually touched must be readable and
    /// writable by the time it is touched. The caller is responsible for
    /// resolving demand-paged slots before the access, see
    /// [`RecordPager`](crate::RecordPager).
    #[must_use]
    pub const unsafe fn from_raw(base: NonNull<PageRecord>, capacity: usize) -> Self {
        Self { base, capacity }
    }

    /// Number of record slots, one per trackable physical page.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Virtual address of the record slot for `index`. This is where the
    /// allocator is about to read or write, and therefore the address that
    /// must be resolved for demand-paged record windows.
    #[must_use]
    pub fn address_of(&self, index: PageIndex) -> VirtualAddress {
        VirtualAddress::from_ptr(self.slot(index).as_ptr().cast_const())
    }

    /// Reads the record for `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` lies beyond the record window. Physical pages past
    /// the window cannot be tracked and must never reach the allocator.
    #[must_use]
    pub fn get(&self, index: PageIndex) -> PageRecord {
        unsafe { self.slot(index).read() }
    }

    /// Writes the record for `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` lies beyond the record window.
    pub fn set(&mut self, index: PageIndex, record: PageRecord) {
        unsafe { self.slot(index).write(record) }
    }

    fn slot(&self, index: PageIndex) -> NonNull<PageRecord> {
        assert!(
            index.as_usize() < self.capacity,
            "page index beyond the record window"
        );
        unsafe { self.base.add(index.as_usize()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_one_slot_wide() {
        assert_eq!(size_of::<PageRecord>() as u64, PAGE_RECORD_BYTES);
        assert_eq!(align_of::<PageRecord>(), 4);
    }

    #[test]
    fn absent_record_is_all_zero() {
        let record = PageRecord::absent();
        assert!(!record.present());
        assert!(!record.allocated());
        assert_eq!(record.next_free(), 0);
    }

    #[test]
    fn link_word_follows_allocation_state() {
        let record = PageRecord::absent().with_present().with_allocated_refs(3);
        assert!(record.present());
        assert!(record.allocated());
        assert_eq!(record.refs(), 3);

        let freed = record.with_free_link(-1);
        assert!(freed.present());
        assert!(!freed.allocated());
        assert_eq!(freed.next_free(), -1);
    }

    #[test]
    fn view_reads_and_writes_slots() {
        let mut storage = [PageRecord::absent(); 8];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        let mut records = unsafe { PageRecords::from_raw(base, storage.len()) };

        let index = PageIndex::new(5);
        records.set(index, PageRecord::absent().with_present().with_free_link(2));
        let record = records.get(index);
        assert!(record.present());
        assert_eq!(record.next_free(), 2);
        assert_eq!(
            records.address_of(index).as_u64(),
            records.address_of(PageIndex::new(0)).as_u64() + 5 * PAGE_RECORD_BYTES
        );
    }

    #[test]
    #[should_panic(expected = "beyond the record window")]
    fn out_of_window_index_panics() {
        let mut storage = [PageRecord::absent(); 2];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        let records = unsafe { PageRecords::from_raw(base, storage.len()) };
        let _ = records.get(PageIndex::new(2));
    }
}
