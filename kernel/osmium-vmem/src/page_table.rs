//! Tables, entries and virtual-address decomposition.
//!
//! One entry layout serves all four levels; what differs per level is only
//! how the `large` bit reads (terminal leaf at L2/L3, PAT at L1) and which
//! index type selects the entry. The typed indices make it impossible to
//! hand an L1 index to an L4 table without the mistake showing in the
//! signature.

use bitfield_struct::bitfield;
use core::ops::{Index, IndexMut};

use osmium_addresses::{PhysicalAddress, VirtualAddress};

/// Bits 51:12 of an entry: the referenced physical frame.
pub const ENTRY_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Everything that is not the frame number: flag bits low and high.
pub const ENTRY_FLAGS_MASK: u64 = !ENTRY_ADDRESS_MASK;

/// One page-table entry, any level.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Entry references a live translation.
    pub present: bool,
    /// Writes allowed through this entry.
    pub writable: bool,
    /// User-mode access allowed. Stays clear; this address space is
    /// kernel-private.
    pub user: bool,
    /// Write-through caching.
    pub write_through: bool,
    /// Caching disabled.
    pub cache_disable: bool,
    /// Set by hardware on first access through the entry.
    pub accessed: bool,
    /// Set by hardware on first write (leaf entries only).
    pub dirty: bool,
    /// At L2/L3: the entry is a terminal large leaf. At L1 this position is
    /// the PAT bit; aligned frame addresses keep it clear.
    pub large: bool,
    /// Translation survives a CR3 reload.
    pub global: bool,
    /// OS-available low bits (9..11); not interpreted by hardware.
    #[bits(3)]
    __avl_low: u8,
    /// Bits 51:12 of the referenced physical address.
    #[bits(40)]
    frame: u64,
    /// OS-available high bits (52..62); not interpreted by hardware.
    #[bits(11)]
    __avl_high: u16,
    /// Instruction fetches through this entry fault.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// The referenced physical address (frame-aligned).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Entry with the referenced physical address replaced.
    #[inline]
    #[must_use]
    pub const fn with_address(self, addr: PhysicalAddress) -> Self {
        self.with_frame(addr.as_u64() >> 12)
    }

    /// Link entry for an intermediate table: present, writable, never
    /// executable. Leaf entries below restrict further as their content
    /// class demands.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
            .with_address(table)
    }
}

/// What the mapped bytes are for; translates to entry permission bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContentClass {
    /// Executable, read-only.
    Code,
    /// Readable only, never executable.
    ReadOnlyData,
    /// Readable and writable, never executable.
    ReadWriteData,
}

impl ContentClass {
    /// Applies this class's permission bits on top of `entry` and marks it
    /// present.
    #[inline]
    #[must_use]
    pub const fn apply(self, entry: PageTableEntry) -> PageTableEntry {
        let entry = entry.with_present(true);
        match self {
            Self::Code => entry,
            Self::ReadOnlyData => entry.with_no_execute(true),
            Self::ReadWriteData => entry.with_writable(true).with_no_execute(true),
        }
    }
}

/// Leaf granularity of a mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSizeClass {
    /// 4 KiB leaf in an L1 table.
    Size4K,
    /// 2 MiB leaf directly in an L2 table (`large` bit set).
    Size2M,
}

impl PageSizeClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
        }
    }
}

macro_rules! level_index {
    ($name:ident, $shift:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct $name(usize);

        impl $name {
            /// Bit position of this level's index within a virtual address.
            pub const SHIFT: u32 = $shift;

            /// Index selecting `va`'s entry at this level.
            #[inline]
            #[must_use]
            #[allow(clippy::cast_possible_truncation)]
            pub const fn of(va: VirtualAddress) -> Self {
                Self(((va.as_u64() >> $shift) & 0x1FF) as usize)
            }

            /// Raw index, guaranteed `< 512`.
            #[inline]
            #[must_use]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }
    };
}

level_index!(L4Index, 39, "Index into the root (level 4) table.");
level_index!(L3Index, 30, "Index into a level 3 table.");
level_index!(L2Index, 21, "Index into a level 2 table.");
level_index!(L1Index, 12, "Index into a leaf (level 1) table.");

/// Decomposes a virtual address into its four per-level indices.
///
/// The 9-bit masks keep every index in range for any input; whether the
/// address is canonical is the walk's concern, not the decomposition's.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L4Index, L3Index, L2Index, L1Index) {
    (
        L4Index::of(va),
        L3Index::of(va),
        L2Index::of(va),
        L1Index::of(va),
    )
}

/// One 4 KiB page table: 512 entries of 8 bytes.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Entries per table.
    pub const LEN: usize = 512;

    /// A table with every entry clear.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::new(); 512],
        }
    }

    /// Clears every entry.
    pub const fn zero(&mut self) {
        self.entries = [PageTableEntry::new(); 512];
    }

    /// Entry at a raw index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 512`.
    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    /// Replaces the entry at a raw index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 512`.
    #[inline]
    pub const fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::empty()
    }
}

macro_rules! table_index {
    ($idx:ty) => {
        impl Index<$idx> for PageTable {
            type Output = PageTableEntry;

            #[inline]
            fn index(&self, index: $idx) -> &PageTableEntry {
                &self.entries[index.as_usize()]
            }
        }

        impl IndexMut<$idx> for PageTable {
            #[inline]
            fn index_mut(&mut self, index: $idx) -> &mut PageTableEntry {
                &mut self.entries[index.as_usize()]
            }
        }
    };
}

table_index!(L4Index);
table_index!(L3Index);
table_index!(L2Index);
table_index!(L1Index);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_eight_bytes_and_a_table_is_one_page() {
        assert_eq!(size_of::<PageTableEntry>(), 8);
        assert_eq!(size_of::<PageTable>(), 4096);
        assert_eq!(align_of::<PageTable>(), 4096);
    }

    #[test]
    fn address_mask_matches_frame_field() {
        let entry = PageTableEntry::from_bits(u64::MAX);
        assert_eq!(
            entry.address().as_u64(),
            u64::MAX & ENTRY_ADDRESS_MASK,
            "frame field must cover exactly bits 51:12"
        );
        assert_eq!(ENTRY_FLAGS_MASK, !ENTRY_ADDRESS_MASK);
    }

    #[test]
    fn with_address_preserves_flags() {
        let entry = PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
            .with_address(PhysicalAddress::new(0x000f_ffff_ffff_f000));
        assert!(entry.present());
        assert!(entry.writable());
        assert!(entry.no_execute());
        assert_eq!(entry.address().as_u64(), 0x000f_ffff_ffff_f000);

        let moved = entry.with_address(PhysicalAddress::new(0x1000));
        assert_eq!(moved.address().as_u64(), 0x1000);
        assert!(moved.present() && moved.writable() && moved.no_execute());
    }

    #[test]
    fn content_classes_translate_to_bits() {
        let code = ContentClass::Code.apply(PageTableEntry::new());
        assert!(code.present() && !code.writable() && !code.no_execute());

        let ro = ContentClass::ReadOnlyData.apply(PageTableEntry::new());
        assert!(ro.present() && !ro.writable() && ro.no_execute());

        let rw = ContentClass::ReadWriteData.apply(PageTableEntry::new());
        assert!(rw.present() && rw.writable() && rw.no_execute());
    }

    #[test]
    fn table_link_is_present_writable_not_executable() {
        let link = PageTableEntry::table_link(PhysicalAddress::new(0xABC000));
        assert!(link.present() && link.writable() && link.no_execute());
        assert!(!link.large());
        assert_eq!(link.address().as_u64(), 0xABC000);
    }

    #[test]
    fn split_indices_at_zero_and_max() {
        let (l4, l3, l2, l1) = split_indices(VirtualAddress::new(0));
        assert_eq!(
            (l4.as_usize(), l3.as_usize(), l2.as_usize(), l1.as_usize()),
            (0, 0, 0, 0)
        );

        let (l4, l3, l2, l1) = split_indices(VirtualAddress::new(u64::MAX));
        assert_eq!(
            (l4.as_usize(), l3.as_usize(), l2.as_usize(), l1.as_usize()),
            (511, 511, 511, 511)
        );
    }

    #[test]
    fn split_indices_at_canonical_boundaries() {
        // Last address of the low half.
        let (l4, l3, l2, l1) = split_indices(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF));
        assert_eq!(
            (l4.as_usize(), l3.as_usize(), l2.as_usize(), l1.as_usize()),
            (255, 511, 511, 511)
        );

        // First address of the high half.
        let (l4, l3, l2, l1) = split_indices(VirtualAddress::new(0xFFFF_8000_0000_0000));
        assert_eq!(
            (l4.as_usize(), l3.as_usize(), l2.as_usize(), l1.as_usize()),
            (256, 0, 0, 0)
        );
    }

    #[test]
    fn typed_indices_address_distinct_slots() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8010_3000);
        let mut table = PageTable::empty();
        let (l4, l3, l2, l1) = split_indices(va);

        table[l1] = PageTableEntry::new().with_present(true);
        assert!(table[l1].present());
        assert_eq!(table.entry(l1.as_usize()), table[l1]);

        // The same table indexed at other levels reads different slots.
        assert!(!table[l2].present() || l2.as_usize() == l1.as_usize());
        let _ = (l4, l3);
    }

    #[test]
    fn free_table_starts_clear() {
        let table = PageTable::empty();
        for i in 0..PageTable::LEN {
            assert_eq!(table.entry(i).into_bits(), 0);
        }
    }
}
