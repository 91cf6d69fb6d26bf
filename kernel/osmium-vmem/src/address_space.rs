//! The four-level walk: map, unmap, query.

use osmium_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};

use crate::page_table::{
    ContentClass, PageSizeClass, PageTable, PageTableEntry, split_indices,
};
use crate::{FrameAlloc, MapError, PhysMapper};

/// One paging hierarchy, identified by its root (L4) table.
///
/// The struct holds nothing but the root's physical page; the mapper and
/// frame source arrive per call so the same walk code serves the live
/// kernel space (temporary-mapping window, real frames) and host tests
/// (simulated memory). Walks are not internally synchronized; the owner
/// serializes them, which the VM layer does under its interrupt lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressSpace {
    root: PhysicalPage<Size4K>,
}

/// Result of a successful [`AddressSpace::query`].
#[derive(Debug, Copy, Clone)]
pub struct Translation {
    /// Physical address the queried virtual address translates to.
    pub address: PhysicalAddress,
    /// Granularity of the leaf that produced the translation.
    pub size: PageSizeClass,
    /// The raw leaf entry, for permission checks.
    pub entry: PageTableEntry,
}

impl Translation {
    /// Whether writes are allowed through the leaf.
    #[inline]
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.entry.writable()
    }
}

impl AddressSpace {
    #[must_use]
    pub const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self { root }
    }

    /// Physical page of the root (L4) table.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Installs one leaf mapping `virt -> phys`.
    ///
    /// Missing intermediate tables are pulled from `alloc` and zeroed
    /// through `mapper` before being linked. An existing leaf at `virt` is
    /// replaced; invalidating the stale TLB entry is the caller's concern
    /// (the demand-paging promotion path relies on this replace semantic).
    ///
    /// # Errors
    ///
    /// [`MapError::NotAligned`] if `virt` or `phys` is not aligned to
    /// `size`; [`MapError::FrameExhausted`] if `alloc` runs dry;
    /// [`MapError::LargeLeaf`] if the walk hits a terminal large leaf above
    /// the requested level.
    pub fn map_one<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        class: ContentClass,
        size: PageSizeClass,
    ) -> Result<VirtualAddress, MapError> {
        let (l4, l3, l2, l1) = split_indices(virt);
        match size {
            PageSizeClass::Size4K => {
                if !virt.is_aligned_to::<Size4K>() || !phys.is_aligned_to::<Size4K>() {
                    return Err(MapError::NotAligned);
                }
                let l3t = next_table_or_create(mapper, alloc, self.root, l4.as_usize())?;
                let l2t = next_table_or_create(mapper, alloc, l3t, l3.as_usize())?;
                let l1t = next_table_or_create(mapper, alloc, l2t, l2.as_usize())?;
                let leaf = class.apply(PageTableEntry::new().with_address(phys));
                set_entry_at(mapper, l1t, l1.as_usize(), leaf);
            }
            PageSizeClass::Size2M => {
                if !virt.is_aligned_to::<Size2M>() || !phys.is_aligned_to::<Size2M>() {
                    return Err(MapError::NotAligned);
                }
                let l3t = next_table_or_create(mapper, alloc, self.root, l4.as_usize())?;
                let l2t = next_table_or_create(mapper, alloc, l3t, l3.as_usize())?;
                let leaf = class.apply(PageTableEntry::new().with_large(true).with_address(phys));
                set_entry_at(mapper, l2t, l2.as_usize(), leaf);
            }
        }
        Ok(virt)
    }

    /// Removes the 4 KiB leaf at `virt` and returns the frame it mapped.
    ///
    /// The TLB entry is left to the caller, as with
    /// [`map_one`](Self::map_one).
    ///
    /// # Errors
    ///
    /// [`MapError::NotMapped`] if any level on the way down is absent;
    /// [`MapError::LargeLeaf`] if the translation ends in a 2 MiB or larger
    /// leaf, which this operation does not take apart.
    pub fn unmap_one<M: PhysMapper>(
        &self,
        mapper: &M,
        virt: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let (l4, l3, l2, l1) = split_indices(virt);
        let l3t = next_table(mapper, self.root, l4.as_usize())?;
        let l2t = next_table(mapper, l3t, l3.as_usize())?;
        let l1t = next_table(mapper, l2t, l2.as_usize())?;
        let leaf = entry_at(mapper, l1t, l1.as_usize());
        if !leaf.present() {
            return Err(MapError::NotMapped);
        }
        set_entry_at(mapper, l1t, l1.as_usize(), PageTableEntry::new());
        Ok(leaf.address().page())
    }

    /// Translates `virt` through the hierarchy.
    ///
    /// 2 MiB leaves translate with their in-leaf offset. 1 GiB leaves are
    /// never created by this subsystem and are reported as an error rather
    /// than guessed at.
    ///
    /// # Errors
    ///
    /// [`MapError::NotMapped`] if the address has no live translation;
    /// [`MapError::LargeLeaf`] if the walk finds a 1 GiB leaf.
    pub fn query<M: PhysMapper>(
        &self,
        mapper: &M,
        virt: VirtualAddress,
    ) -> Result<Translation, MapError> {
        let (l4, l3, l2, l1) = split_indices(virt);

        let l4e = entry_at(mapper, self.root, l4.as_usize());
        if !l4e.present() {
            return Err(MapError::NotMapped);
        }

        let l3e = entry_at(mapper, l4e.address().page(), l3.as_usize());
        if !l3e.present() {
            return Err(MapError::NotMapped);
        }
        if l3e.large() {
            return Err(MapError::LargeLeaf);
        }

        let l2e = entry_at(mapper, l3e.address().page(), l2.as_usize());
        if !l2e.present() {
            return Err(MapError::NotMapped);
        }
        if l2e.large() {
            return Ok(Translation {
                address: l2e.address() + virt.offset_in::<Size2M>(),
                size: PageSizeClass::Size2M,
                entry: l2e,
            });
        }

        let l1e = entry_at(mapper, l2e.address().page(), l1.as_usize());
        if !l1e.present() {
            return Err(MapError::NotMapped);
        }
        Ok(Translation {
            address: l1e.address() + virt.offset_in::<Size4K>(),
            size: PageSizeClass::Size4K,
            entry: l1e,
        })
    }
}

fn entry_at<M: PhysMapper>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: usize,
) -> PageTableEntry {
    // Safety: walk tables belong to this address space and walks are
    // serialized by the owner.
    unsafe { mapper.with_table(table, |t| t.entry(index)) }
}

fn set_entry_at<M: PhysMapper>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: usize,
    entry: PageTableEntry,
) {
    // Safety: as for `entry_at`.
    unsafe { mapper.with_table(table, |t| t.set_entry(index, entry)) };
}

/// Follows a non-leaf entry downwards.
fn next_table<M: PhysMapper>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: usize,
) -> Result<PhysicalPage<Size4K>, MapError> {
    let entry = entry_at(mapper, table, index);
    if !entry.present() {
        return Err(MapError::NotMapped);
    }
    if entry.large() {
        return Err(MapError::LargeLeaf);
    }
    Ok(entry.address().page())
}

/// Follows a non-leaf entry downwards, creating the next table if absent.
///
/// A fresh table is zeroed through the mapper before the link goes live, so
/// the hardware can never observe uninitialized entries.
fn next_table_or_create<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
    table: PhysicalPage<Size4K>,
    index: usize,
) -> Result<PhysicalPage<Size4K>, MapError> {
    let entry = entry_at(mapper, table, index);
    if entry.present() {
        if entry.large() {
            return Err(MapError::LargeLeaf);
        }
        return Ok(entry.address().page());
    }

    let fresh = alloc.alloc_4k().ok_or(MapError::FrameExhausted)?;
    // Safety: the frame was just allocated; nothing else references it.
    unsafe { mapper.with_table(fresh, PageTable::zero) };
    set_entry_at(mapper, table, index, PageTableEntry::table_link(fresh.base()));
    Ok(fresh)
}
