//! First-fit kernel heap for allocations below page granularity.
//!
//! The heap manages a fixed arena carved out of the kernel's address space.
//! Free spans form an address-ordered singly linked list whose nodes live
//! inside the spans themselves; allocated spans carry a small header just
//! below the returned pointer, so freeing needs only the pointer.
//!
//! The heap's bookkeeping writes land in arena memory that is demand-paged.
//! Those writes happen under the subsystem lock where a page fault must not
//! occur, so [`KernelHeap::allocate`] reports each page it is about to write
//! a header into through a resolve callback and only mutates once every
//! callback succeeded. Freeing never needs the callback: every block
//! boundary has carried a header or a list node before, so its page is
//! already resolved.

use core::alloc::Layout;
use core::ptr::NonNull;

use osmium_addresses::{Size4K, VirtualAddress};

/// Minimum alignment and bookkeeping granularity. Block boundaries stay on
/// this grid, which also keeps every 16-byte header write inside one page.
const ALIGN: u64 = 16;

/// Smallest block worth keeping on the free list. Remainders below this are
/// absorbed into the allocation they were split from.
const MIN_BLOCK: u64 = 32;

const HEADER: u64 = size_of::<UsedHeader>() as u64;

/// Node written at the start of a free span.
#[repr(C)]
struct FreeBlock {
    size: u64,
    next: Option<NonNull<FreeBlock>>,
}

/// Header written directly below an allocation's payload.
///
/// `span` is the whole block size and `start_offset` the distance from the
/// block start to the payload, which exceeds [`HEADER`] when the payload
/// needed extra alignment.
#[repr(C)]
struct UsedHeader {
    span: u64,
    start_offset: u64,
}

/// Fixed-arena heap with an intrusive, address-ordered free list.
///
/// `arena` is where the bytes actually live; `region_base` is the virtual
/// address the arena occupies in the kernel's region bookkeeping. The two
/// coincide on hardware, while tests back the arena with host memory and
/// keep `region_base` at the kernel constant the resolve callback expects.
/// Payload alignment is honored relative to the arena base, which the
/// kernel seats on a page boundary.
pub struct KernelHeap {
    arena: NonNull<u8>,
    region_base: VirtualAddress,
    size: u64,
    head: Option<NonNull<FreeBlock>>,
    seeded: bool,
}

// Safety: the arena is exclusively owned by the heap; sending the heap
// moves that ownership whole.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Creates a heap over `size` bytes at `arena`.
    ///
    /// The arena is not touched until the first allocation, because writing
    /// the initial free node already requires the resolve callback.
    #[must_use]
    pub const fn new(arena: NonNull<u8>, region_base: VirtualAddress, size: u64) -> Self {
        Self {
            arena,
            region_base,
            size,
            head: None,
            seeded: false,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.arena.addr().get();
        let addr = ptr.addr().get();
        addr >= base && ((addr - base) as u64) < self.size
    }

    /// Allocates `layout` from the first free block that fits.
    ///
    /// `resolve` is called with the page of every address the heap is about
    /// to write bookkeeping into and must make that page writable; when it
    /// returns `false` the heap stays unchanged and the allocation fails.
    /// Returns `None` when no block fits or a page could not be resolved.
    pub fn allocate(
        &mut self,
        layout: Layout,
        mut resolve: impl FnMut(VirtualAddress) -> bool,
    ) -> Option<NonNull<u8>> {
        if !self.seed(&mut resolve) {
            return None;
        }

        let need = (layout.size() as u64).max(1);
        let align = (layout.align() as u64).max(ALIGN);

        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let block_off = self.offset_of(block);
            let (block_size, next) = unsafe {
                let node = block.as_ptr();
                ((*node).size, (*node).next)
            };

            if let Some((payload, fitted)) = fit(block_off, block_size, need, align) {
                let remainder = block_size - fitted;
                let split = remainder >= MIN_BLOCK;

                // Resolve every page a header lands on before mutating, so
                // a failure leaves the free list intact.
                if !resolve(self.page_of(payload - HEADER)) {
                    return None;
                }
                if split && !resolve(self.page_of(block_off + fitted)) {
                    return None;
                }

                let span = if split {
                    let tail = block_off + fitted;
                    unsafe { self.write_free(tail, remainder, next) };
                    self.relink(prev, Some(self.block_at(tail)));
                    fitted
                } else {
                    self.relink(prev, next);
                    block_size
                };
                unsafe { self.write_used(payload, span, payload - block_off) };
                return Some(self.pointer_at(payload));
            }

            prev = cursor;
            cursor = next;
        }
        None
    }

    /// Returns a block to the free list, coalescing with both neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](Self::allocate) on this heap
    /// and must not have been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let header = unsafe { ptr.cast::<UsedHeader>().as_ptr().sub(1).read() };
        debug_assert!(header.start_offset >= HEADER);
        let start = self.offset_of(ptr) - header.start_offset;
        let span = header.span;
        debug_assert!(start % ALIGN == 0);
        debug_assert!(start + span <= self.size);

        // Find the neighbors in the address-ordered list.
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            let offset = self.offset_of(node);
            debug_assert!(offset != start, "block freed twice");
            if offset > start {
                break;
            }
            prev = cursor;
            cursor = unsafe { (*node.as_ptr()).next };
        }

        let mut merged = span;
        let mut next_link = cursor;
        if let Some(node) = cursor {
            if start + span == self.offset_of(node) {
                let (size, next) = unsafe {
                    let follower = node.as_ptr();
                    ((*follower).size, (*follower).next)
                };
                merged += size;
                next_link = next;
            }
        }

        if let Some(node) = prev {
            let offset = self.offset_of(node);
            let size = unsafe { (*node.as_ptr()).size };
            if offset + size == start {
                unsafe {
                    (*node.as_ptr()).size = size + merged;
                    (*node.as_ptr()).next = next_link;
                }
                return;
            }
        }
        unsafe { self.write_free(start, merged, next_link) };
        self.relink(prev, Some(self.block_at(start)));
    }

    /// Writes the initial free node covering the whole arena.
    fn seed(&mut self, resolve: &mut impl FnMut(VirtualAddress) -> bool) -> bool {
        if self.seeded {
            return true;
        }
        if self.size < MIN_BLOCK || !resolve(self.page_of(0)) {
            return false;
        }
        unsafe { self.write_free(0, self.size, None) };
        self.head = Some(self.block_at(0));
        self.seeded = true;
        true
    }

    fn relink(&mut self, prev: Option<NonNull<FreeBlock>>, value: Option<NonNull<FreeBlock>>) {
        match prev {
            Some(node) => unsafe { (*node.as_ptr()).next = value },
            None => self.head = value,
        }
    }

    /// Page of the region-space address `offset` bytes into the arena.
    fn page_of(&self, offset: u64) -> VirtualAddress {
        VirtualAddress::new(self.region_base.as_u64() + offset).align_down::<Size4K>()
    }

    fn offset_of<T>(&self, ptr: NonNull<T>) -> u64 {
        debug_assert!(ptr.addr().get() >= self.arena.addr().get());
        (ptr.addr().get() - self.arena.addr().get()) as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pointer_at(&self, offset: u64) -> NonNull<u8> {
        debug_assert!(offset < self.size);
        // Offsets come from headers and list nodes the heap wrote itself.
        unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(offset as usize)) }
    }

    fn block_at(&self, offset: u64) -> NonNull<FreeBlock> {
        self.pointer_at(offset).cast()
    }

    unsafe fn write_free(&mut self, offset: u64, size: u64, next: Option<NonNull<FreeBlock>>) {
        unsafe { self.block_at(offset).as_ptr().write(FreeBlock { size, next }) };
    }

    unsafe fn write_used(&mut self, payload: u64, span: u64, start_offset: u64) {
        let header = UsedHeader { span, start_offset };
        unsafe {
            self.pointer_at(payload - HEADER)
                .cast::<UsedHeader>()
                .as_ptr()
                .write(header);
        }
    }
}

/// Earliest aligned payload inside the block, if the block can hold it.
///
/// Returns the absolute payload offset and the used span measured from the
/// block start.
fn fit(block_off: u64, block_size: u64, need: u64, align: u64) -> Option<(u64, u64)> {
    let payload = (block_off + HEADER).checked_next_multiple_of(align)?;
    let end = payload
        .checked_add(need)?
        .checked_next_multiple_of(ALIGN)?;
    let used = end - block_off;
    (used <= block_size).then_some((payload, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: u64 = 0x4000_0000;

    struct Fixture {
        storage: Vec<u128>,
        heap: KernelHeap,
    }

    fn fixture(bytes: usize) -> Fixture {
        let mut storage = vec![0_u128; bytes / 16];
        let arena = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
        let heap = KernelHeap::new(arena, VirtualAddress::new(REGION), bytes as u64);
        Fixture { storage, heap }
    }

    fn grab(heap: &mut KernelHeap, size: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(size, 8).unwrap();
        heap.allocate(layout, |_| true).expect("arena has room")
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut fx = fixture(4096);
        let a = grab(&mut fx.heap, 24);
        let b = grab(&mut fx.heap, 100);
        let c = grab(&mut fx.heap, 1);
        for ptr in [a, b, c] {
            assert_eq!(ptr.addr().get() % 16, 0);
            assert!(fx.heap.contains(ptr));
        }
        unsafe {
            a.as_ptr().write_bytes(0xAA, 24);
            b.as_ptr().write_bytes(0xBB, 100);
            c.as_ptr().write_bytes(0xCC, 1);
        }
        assert_eq!(unsafe { a.as_ptr().read() }, 0xAA);
        assert_eq!(unsafe { b.as_ptr().add(99).read() }, 0xBB);
        assert_eq!(unsafe { c.as_ptr().read() }, 0xCC);
    }

    #[test]
    fn freeing_needs_only_the_pointer() {
        let mut fx = fixture(4096);
        let layout = Layout::from_size_align(48, 64).unwrap();
        let ptr = fx.heap.allocate(layout, |_| true).unwrap();
        assert_eq!((ptr.addr().get() - fx.storage.as_ptr().addr()) % 64, 0);
        unsafe { fx.heap.free(ptr) };
        // The freed block coalesces back; the whole arena minus nothing is
        // available again for a near-arena-sized request.
        let big = Layout::from_size_align(4096 - 32, 8).unwrap();
        assert!(fx.heap.allocate(big, |_| true).is_some());
    }

    #[test]
    fn neighbors_coalesce_in_any_free_order() {
        let mut fx = fixture(4096);
        let a = grab(&mut fx.heap, 200);
        let b = grab(&mut fx.heap, 200);
        let c = grab(&mut fx.heap, 200);
        unsafe { fx.heap.free(b) };
        unsafe { fx.heap.free(a) };
        unsafe { fx.heap.free(c) };
        let big = Layout::from_size_align(4096 - 32, 8).unwrap();
        assert!(fx.heap.allocate(big, |_| true).is_some());
    }

    #[test]
    fn exhaustion_reports_none_and_recovers() {
        let mut fx = fixture(256);
        let a = grab(&mut fx.heap, 100);
        let b = grab(&mut fx.heap, 64);
        assert!(
            fx.heap
                .allocate(Layout::from_size_align(200, 8).unwrap(), |_| true)
                .is_none()
        );
        unsafe { fx.heap.free(a) };
        unsafe { fx.heap.free(b) };
        assert!(
            fx.heap
                .allocate(Layout::from_size_align(200, 8).unwrap(), |_| true)
                .is_some()
        );
    }

    #[test]
    fn resolve_failure_leaves_the_heap_unchanged() {
        let mut fx = fixture(4096);
        let layout = Layout::from_size_align(32, 8).unwrap();
        assert!(fx.heap.allocate(layout, |_| false).is_none());
        let first = fx.heap.allocate(layout, |_| true).unwrap();
        assert_eq!(fx.heap.offset_of(first), HEADER);
    }

    #[test]
    fn resolve_sees_region_space_pages() {
        let mut fx = fixture(4 * 4096);
        let mut seen: Vec<u64> = Vec::new();
        let layout = Layout::from_size_align(2 * 4096, 8).unwrap();
        fx.heap
            .allocate(layout, |va| {
                seen.push(va.as_u64());
                true
            })
            .unwrap();
        assert!(!seen.is_empty());
        for va in seen {
            assert_eq!(va % 4096, 0);
            assert!(va >= REGION && va < REGION + 4 * 4096);
        }
    }

    #[test]
    fn pointers_outside_the_arena_are_not_contained() {
        let fx = fixture(4096);
        let outside = NonNull::from(&0_u8);
        assert!(!fx.heap.contains(outside));
    }

    #[test]
    fn zero_sized_layouts_still_allocate() {
        let mut fx = fixture(4096);
        let layout = Layout::from_size_align(0, 1).unwrap();
        let a = fx.heap.allocate(layout, |_| true).unwrap();
        let b = fx.heap.allocate(layout, |_| true).unwrap();
        assert_ne!(a, b);
    }
}
