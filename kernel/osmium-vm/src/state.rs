//! The virtual memory state: regions, frames, heap, and fault resolution.
//!
//! [`VmState`] is the single-owner struct behind the subsystem: it holds the
//! region tree, the frame allocator, the kernel heap, and the shared zero
//! page, and every operation threads through it. The crate root wraps one
//! instance into the interrupt-masked singleton; tests construct their own
//! instance over simulated physical memory.
//!
//! Bring-up is [`VmState::init`]: stake out the static regions, allocate
//! and zero the shared zero page, then hand the leftover boot ranges to the
//! frame allocator. Record slots that materialize during that handoff are
//! resolved with the same routine the fault path uses, just without a
//! hardware fault.

use core::alloc::Layout;
use core::ptr::NonNull;

use log::{info, warn};
use osmium_addresses::{
    PageSize, PhysicalPage, Size4K, Tier, TierRequest, VirtualAddress,
};
use osmium_frames::{EarlyAllocator, FrameAllocator, PageRecords, RecordPager};
use osmium_info::boot::{BootLayout, MemoryRange};
use osmium_info::layout::{PAGE_RECORDS_BASE, PAGE_RECORDS_SIZE, TEMP_WINDOW_BASE};
use osmium_regions::{RangeKey, RegionNode, RegionTree};
use osmium_vmem::{AddressSpace, ContentClass, MapError, PageFaultCode, PageSizeClass, PhysMapper};

use crate::fault::{FaultError, PanicReason, fatal};
use crate::heap::KernelHeap;
use crate::object::{FaultOutcome, VmObject};

const PAGE_BYTES: usize = 4096;

/// Node slots for the regions that must exist before the heap does.
const BOOTSTRAP_SLOTS: usize = 8;

/// Fixed storage for the bootstrap region nodes.
///
/// The heap region itself has to be in the tree before the heap can serve
/// allocations, so the first few nodes cannot come from the heap. They live
/// here instead, for the lifetime of the subsystem.
pub struct NodeArena {
    slots: [Option<RegionNode<VmObject>>; BOOTSTRAP_SLOTS],
    used: usize,
}

impl NodeArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; BOOTSTRAP_SLOTS],
            used: 0,
        }
    }

    /// Moves `node` into the next free slot and returns its address.
    fn place(&mut self, node: RegionNode<VmObject>) -> Option<NonNull<RegionNode<VmObject>>> {
        let slot = self.slots.get_mut(self.used)?;
        self.used += 1;
        Some(NonNull::from(slot.insert(node)))
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything [`VmState::init`] consumes, gathered from the boot handoff by
/// the crate root (or by a test fixture).
pub struct VmConfig<'ctx> {
    /// The address space the loader left active.
    pub space: AddressSpace,
    /// View of the record window backing the frame allocator.
    pub records: PageRecords,
    /// The boot memory map; the early allocator takes it over.
    pub ranges: &'ctx mut [MemoryRange],
    /// Node storage for the bootstrap regions.
    pub arena: &'ctx mut NodeArena,
    /// Where the kernel heap's bytes live. On hardware this is the heap
    /// region's own virtual address; tests point it at host memory.
    pub heap_storage: NonNull<u8>,
    /// Size of the heap region in bytes.
    pub heap_size: u64,
    /// Image and stack placement inherited from the loader.
    pub layout: BootLayout,
}

/// Single-owner state of the virtual memory subsystem.
pub struct VmState<'ctx, M: PhysMapper> {
    mapper: &'ctx M,
    space: AddressSpace,
    frames: FrameAllocator<'ctx>,
    tree: RegionTree<VmObject>,
    arena: &'ctx mut NodeArena,
    heap: KernelHeap,
    zero_page: PhysicalPage<Size4K>,
    next_free: VirtualAddress,
}

impl<'ctx, M: PhysMapper> VmState<'ctx, M> {
    /// Brings the subsystem up from the boot handoff.
    ///
    /// Stakes out the static regions, allocates and zeroes the shared zero
    /// page, then finalizes the early-to-records handoff. Afterwards every
    /// allocation is served from the tier stacks and faults demand-page the
    /// anonymous regions.
    ///
    /// # Panics
    ///
    /// Panics when physical memory runs out during bring-up or the static
    /// regions collide; the kernel cannot run without its memory subsystem.
    pub fn init(mapper: &'ctx M, config: VmConfig<'ctx>) -> Self {
        let VmConfig {
            space,
            records,
            ranges,
            arena,
            heap_storage,
            heap_size,
            layout,
        } = config;

        info!(
            "initializing virtual memory, image {:#018x}..{:#018x}",
            layout.image_base, layout.image_end
        );
        for range in &*ranges {
            info!("  {:#018x}+{:#x} {}", range.base, range.size, range.kind.as_str());
        }

        let mut frames = FrameAllocator::new(records, EarlyAllocator::new(ranges));

        // The first allocation of all: the page every anonymous region
        // reads through until its first write.
        let Some(zero_page) = frames.alloc(TierRequest::Conventional) else {
            fatal(
                PanicReason::OutOfMemory,
                format_args!("no frame left for the zero page"),
            );
        };
        // Safety: the page was just allocated and nothing maps it yet.
        unsafe {
            mapper.with_page(zero_page, ContentClass::ReadWriteData, |ptr| {
                ptr.as_ptr().write_bytes(0, PAGE_BYTES);
            });
        }

        let heap_base = VirtualAddress::new(layout.image_end);
        let mut state = Self {
            mapper,
            space,
            frames,
            tree: RegionTree::new(),
            arena,
            heap: KernelHeap::new(heap_storage, heap_base, heap_size),
            zero_page,
            // Dynamic regions start above the heap region's end.
            next_free: VirtualAddress::new(layout.image_end + heap_size),
        };

        let static_regions = [
            (layout.image_base, layout.image_end - layout.image_base, VmObject::Null),
            (layout.image_end, heap_size, VmObject::Anonymous),
            (layout.stack_base, layout.stack_size, VmObject::Anonymous),
            (PAGE_RECORDS_BASE, PAGE_RECORDS_SIZE, VmObject::Anonymous),
            (TEMP_WINDOW_BASE, 0u64.wrapping_sub(TEMP_WINDOW_BASE), VmObject::Null),
        ];
        for (base, size, object) in static_regions {
            if state.vm_alloc_at(VirtualAddress::new(base), size, object).is_err() {
                fatal(
                    PanicReason::General,
                    format_args!("no node storage left for the static regions"),
                );
            }
        }

        let mut resolver = RecordResolver {
            mapper,
            space,
            zero_page,
        };

        // Track the zero page before anything else writes records: shared
        // read-only views take references on it, and resolving its record
        // slot here means the steady-state count updates can never fault
        // with the subsystem lock held.
        state.frames.set_allocated(zero_page, &mut resolver);
        state.frames.set_present(zero_page, &mut resolver);

        state.frames.finalize(&mut resolver);
        info!("virtual memory online, allocation cursor at {}", state.next_free);
        state
    }

    /// Resolves the page fault described by `code` at `address`.
    ///
    /// Finds the owning region and runs its object's handler. The anonymous
    /// handler maps the shared zero page read-only on a first touch and
    /// promotes the mapping to a private writable frame on a write; the
    /// faulting access is retried by returning from the exception.
    ///
    /// # Errors
    ///
    /// [`FaultError::NoRegion`] when no region covers the address,
    /// [`FaultError::NoHandler`] when the owning object cannot resolve
    /// faults, [`FaultError::AccessViolation`] when the access itself is
    /// illegal, and [`FaultError::OutOfMemory`] when promotion found no
    /// frame.
    pub fn dispatch_fault(
        &mut self,
        code: PageFaultCode,
        address: VirtualAddress,
    ) -> Result<FaultOutcome, FaultError> {
        let Some(node) = self.tree.search(&RangeKey::probe(address)) else {
            return Err(FaultError::NoRegion);
        };
        // Safety: linked nodes stay live for the subsystem's lifetime.
        let object = *unsafe { node.as_ref() }.payload();
        if !object.handles_faults() {
            return Err(FaultError::NoHandler);
        }
        self.resolve_anonymous(code, address.align_down::<Size4K>())
    }

    /// Reserves `size` bytes of address space backed by `object`.
    ///
    /// The region starts at the first gap at or above the allocation
    /// cursor. Nothing is mapped up front; anonymous regions materialize
    /// through faults.
    ///
    /// # Errors
    ///
    /// [`FaultError::OutOfMemory`] when no node storage is left or the
    /// cursor reached the top of the address space.
    pub fn vm_alloc(&mut self, size: u64, object: VmObject) -> Result<VirtualAddress, FaultError> {
        let size = size.max(1).next_multiple_of(Size4K::SIZE);
        let mut cursor = self.next_free;
        loop {
            match self.tree.locate(&RangeKey::new(cursor, size)) {
                Err(at) => {
                    let node = self.new_region_node(RangeKey::new(cursor, size), object)?;
                    // Safety: the node is fresh and nothing touched the
                    // tree since the point was computed.
                    unsafe { self.tree.insert(node, at) };
                    self.next_free = VirtualAddress::new(cursor.as_u64() + size);
                    return Ok(cursor);
                }
                Ok(blocking) => {
                    // Skip past the blocking region and retry from there.
                    let key = unsafe { blocking.as_ref() }.key();
                    let skip = key
                        .address()
                        .as_u64()
                        .checked_add(key.size())
                        .and_then(|end| end.checked_next_multiple_of(Size4K::SIZE));
                    let Some(next) = skip else {
                        // The blocker reaches the top of the address space.
                        return Err(FaultError::OutOfMemory);
                    };
                    cursor = VirtualAddress::new(next);
                }
            }
        }
    }

    /// Reserves the exact span `[address, address + size)` backed by
    /// `object`. Bring-up stakes out the static regions with this; later
    /// callers place fixed windows such as device mappings.
    ///
    /// # Errors
    ///
    /// [`FaultError::OutOfMemory`] when no node storage is left.
    ///
    /// # Panics
    ///
    /// Panics when the span collides with a live region.
    pub fn vm_alloc_at(
        &mut self,
        address: VirtualAddress,
        size: u64,
        object: VmObject,
    ) -> Result<VirtualAddress, FaultError> {
        let key = RangeKey::new(address, size.max(1).next_multiple_of(Size4K::SIZE));
        let Err(at) = self.tree.locate(&key) else {
            fatal(
                PanicReason::General,
                format_args!("region {key} overlaps a live region"),
            );
        };
        let node = self.new_region_node(key, object)?;
        // Safety: the node is fresh; node allocation never touches the
        // tree, so the insertion point is still current.
        unsafe { self.tree.insert(node, at) };
        info!("region {key} {object}");
        Ok(address)
    }

    /// Allocates kernel memory: requests of a page or more get their own
    /// anonymous region, smaller ones come from the heap.
    ///
    /// # Errors
    ///
    /// [`FaultError::OutOfMemory`] when the backing source is exhausted.
    #[allow(clippy::cast_possible_truncation)]
    pub fn memory_alloc(&mut self, size: u64) -> Result<NonNull<u8>, FaultError> {
        if size >= Size4K::SIZE {
            let address = self.vm_alloc(size, VmObject::Anonymous)?;
            return NonNull::new(address.as_u64() as usize as *mut u8)
                .ok_or(FaultError::OutOfMemory);
        }
        let Ok(layout) = Layout::from_size_align((size as usize).max(1), 16) else {
            return Err(FaultError::OutOfMemory);
        };
        self.heap_allocate(layout).ok_or(FaultError::OutOfMemory)
    }

    /// Releases memory from [`memory_alloc`](Self::memory_alloc).
    ///
    /// Heap blocks coalesce back into the free list. Page-scale blocks keep
    /// their region and frames until address-space reclaim exists; the leak
    /// is logged.
    pub fn memory_free(&mut self, ptr: NonNull<u8>) {
        if self.heap.contains(ptr) {
            // Safety: the heap owns every pointer it contains.
            unsafe { self.heap.free(ptr) };
            return;
        }
        warn!("leaking page-scale allocation at {:#018x}", ptr.addr().get());
    }

    /// Allocates one physical page for callers that manage their own
    /// mappings.
    ///
    /// # Errors
    ///
    /// [`FaultError::OutOfMemory`] when the request's tiers are exhausted.
    pub fn page_alloc(&mut self, request: TierRequest) -> Result<PhysicalPage<Size4K>, FaultError> {
        self.frames.alloc(request).ok_or(FaultError::OutOfMemory)
    }

    /// Releases one reference to `page`, reclaiming it at zero references.
    ///
    /// `page` must have come from [`page_alloc`](Self::page_alloc), which
    /// guarantees its record slot is materialized.
    pub fn page_free(&mut self, page: PhysicalPage<Size4K>) {
        self.frames.free(page);
    }

    /// The address space the subsystem operates on.
    #[must_use]
    pub const fn space(&self) -> AddressSpace {
        self.space
    }

    /// The shared page behind first-touch reads of anonymous regions.
    #[must_use]
    pub const fn zero_page(&self) -> PhysicalPage<Size4K> {
        self.zero_page
    }

    /// Number of pages currently free in `tier`.
    #[must_use]
    pub const fn free_pages(&self, tier: Tier) -> u64 {
        self.frames.free_pages(tier)
    }

    /// Number of present pages in `tier`, free or allocated.
    #[must_use]
    pub const fn total_pages(&self, tier: Tier) -> u64 {
        self.frames.total_pages(tier)
    }

    /// Demand paging for anonymous regions.
    fn resolve_anonymous(
        &mut self,
        code: PageFaultCode,
        page_va: VirtualAddress,
    ) -> Result<FaultOutcome, FaultError> {
        if !code.present() {
            map_zero_view(self.mapper, self.space, &mut self.frames, self.zero_page, page_va)?;
            return Ok(FaultOutcome::ZeroMapped);
        }
        if code.write() {
            promote_writable(self.mapper, self.space, &mut self.frames, self.zero_page, page_va)?;
            return Ok(FaultOutcome::Promoted);
        }
        // Present and not a write: the mapping is fine, the access is not
        // (instruction fetch from no-execute memory, user access to a
        // kernel page, or a reserved-bit walk).
        Err(FaultError::AccessViolation)
    }

    /// Carves a region node out of the bootstrap arena or, once the early
    /// allocator has been retired, the kernel heap.
    fn new_region_node(
        &mut self,
        key: RangeKey,
        object: VmObject,
    ) -> Result<NonNull<RegionNode<VmObject>>, FaultError> {
        if !self.frames.is_finalized() {
            return self
                .arena
                .place(RegionNode::new(key, object))
                .ok_or(FaultError::OutOfMemory);
        }
        let Some(ptr) = self.heap_allocate(Layout::new::<RegionNode<VmObject>>()) else {
            return Err(FaultError::OutOfMemory);
        };
        let node = ptr.cast::<RegionNode<VmObject>>();
        // Safety: the heap returned a fresh block of the right layout.
        unsafe { node.as_ptr().write(RegionNode::new(key, object)) };
        Ok(node)
    }

    /// Heap allocation with the no-fault-under-lock contract honored: every
    /// page the heap is about to write a header into is made writable
    /// through the anonymous routine first.
    fn heap_allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let mapper = self.mapper;
        let space = self.space;
        let zero_page = self.zero_page;
        let frames = &mut self.frames;
        self.heap.allocate(layout, |page| {
            resolve_writable(mapper, space, frames, zero_page, page).is_ok()
        })
    }
}

/// [`RecordPager`] wired from the pieces `init` has on hand: record slots
/// that materialize during the early-to-records handoff are resolved with
/// the fault path's own routine, called directly.
struct RecordResolver<'a, M: PhysMapper> {
    mapper: &'a M,
    space: AddressSpace,
    zero_page: PhysicalPage<Size4K>,
}

impl<M: PhysMapper> RecordPager for RecordResolver<'_, M> {
    fn prepare(&mut self, frames: &mut FrameAllocator<'_>, slot: VirtualAddress) {
        let page = slot.align_down::<Size4K>();
        let resolved = resolve_writable(self.mapper, self.space, frames, self.zero_page, page);
        if resolved.is_err() {
            fatal(
                PanicReason::OutOfMemory,
                format_args!("no frame left for the record slot at {slot}"),
            );
        }
    }
}

/// Makes `page_va` writable without a hardware fault, in the same two steps
/// the fault path takes: an absent mapping first gets the read-only zero
/// view, then a private frame replaces whatever read-only view is present.
fn resolve_writable<M: PhysMapper>(
    mapper: &M,
    space: AddressSpace,
    frames: &mut FrameAllocator<'_>,
    zero_page: PhysicalPage<Size4K>,
    page_va: VirtualAddress,
) -> Result<(), FaultError> {
    debug_assert!(page_va.is_aligned_to::<Size4K>());
    match space.query(mapper, page_va) {
        Ok(translation) if translation.writable() => Ok(()),
        Ok(_) => promote_writable(mapper, space, frames, zero_page, page_va),
        Err(MapError::NotMapped) => {
            map_zero_view(mapper, space, frames, zero_page, page_va)?;
            promote_writable(mapper, space, frames, zero_page, page_va)
        }
        Err(_) => Err(FaultError::AccessViolation),
    }
}

/// Maps the shared zero page read-only at `page_va` and takes a reference
/// on it.
fn map_zero_view<M: PhysMapper>(
    mapper: &M,
    space: AddressSpace,
    frames: &mut FrameAllocator<'_>,
    zero_page: PhysicalPage<Size4K>,
    page_va: VirtualAddress,
) -> Result<(), FaultError> {
    space
        .map_one(
            mapper,
            frames,
            page_va,
            zero_page.base(),
            ContentClass::ReadOnlyData,
            PageSizeClass::Size4K,
        )
        .map_err(map_error)?;
    // Every read-only view holds a reference on the zero page. The count is
    // missing exactly once: while the zero page's own record slot is being
    // resolved, the record is not written yet and the call is a no-op.
    frames.inc_ref(zero_page);
    Ok(())
}

/// Replaces the mapping at `page_va` with a private, writable, zero-filled
/// frame and drops the replaced view's reference on the zero page.
fn promote_writable<M: PhysMapper>(
    mapper: &M,
    space: AddressSpace,
    frames: &mut FrameAllocator<'_>,
    zero_page: PhysicalPage<Size4K>,
    page_va: VirtualAddress,
) -> Result<(), FaultError> {
    let Some(frame) = frames.alloc(TierRequest::Conventional) else {
        return Err(FaultError::OutOfMemory);
    };
    let mapped = space.map_one(
        mapper,
        frames,
        page_va,
        frame.base(),
        ContentClass::ReadWriteData,
        PageSizeClass::Size4K,
    );
    if let Err(error) = mapped {
        frames.free(frame);
        return Err(map_error(error));
    }
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // Safety: the leaf at page_va was just replaced; the stale entry must go.
    unsafe {
        osmium_vmem::mmu::invalidate(page_va);
    }
    // The fresh frame must read as zero, like the view it replaces.
    // Safety: the frame was just allocated; this is its only reference.
    unsafe {
        mapper.with_page(frame, ContentClass::ReadWriteData, |ptr| {
            ptr.as_ptr().write_bytes(0, PAGE_BYTES);
        });
    }
    frames.dec_ref(zero_page);
    Ok(())
}

const fn map_error(error: MapError) -> FaultError {
    match error {
        MapError::FrameExhausted => FaultError::OutOfMemory,
        MapError::NotMapped | MapError::NotAligned | MapError::LargeLeaf => {
            FaultError::AccessViolation
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_bootstrap_arena_has_a_hard_capacity() {
        let mut arena = NodeArena::new();
        let mut placed = 0_u64;
        for i in 1..=64_u64 {
            let key = RangeKey::new(VirtualAddress::new(i * 0x1000), 0x1000);
            if arena.place(RegionNode::new(key, VmObject::Null)).is_none() {
                break;
            }
            placed = i;
        }
        assert_eq!(placed, BOOTSTRAP_SLOTS as u64);
    }

    #[test]
    fn map_errors_collapse_to_fault_errors() {
        assert_eq!(map_error(MapError::FrameExhausted), FaultError::OutOfMemory);
        assert_eq!(map_error(MapError::NotMapped), FaultError::AccessViolation);
        assert_eq!(map_error(MapError::LargeLeaf), FaultError::AccessViolation);
    }
}
