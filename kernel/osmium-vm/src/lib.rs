//! # Kernel Virtual Memory
//!
//! The top of the memory stack: address-space regions backed by VM objects,
//! page-fault dispatch, the kernel heap, and the allocation entry points
//! the rest of the kernel calls.
//!
//! The kernel's address space is a set of non-overlapping regions in an
//! interval tree. Each region names a [`VmObject`] deciding what a page
//! fault inside it means: anonymous regions demand-page against a shared
//! zero page (first touch maps it read-only, the first write promotes the
//! mapping to a private frame), every other kind makes faults fatal.
//!
//! All state lives in one [`VmState`], wrapped into an interrupt-masked
//! singleton by [`init`]. The free functions at the crate root are the
//! kernel-facing surface over that singleton; exhaustion and misuse do not
//! come back as errors from them, they halt with a [`PanicReason`]. Library
//! code underneath reports [`FaultError`] and stays testable on the host,
//! where tests drive a [`VmState`] of their own over simulated physical
//! memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod fault;
mod heap;
mod object;
mod state;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use log::error;
use osmium_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, TierRequest, VirtualAddress,
};
use osmium_frames::{PageRecord, PageRecords};
use osmium_info::boot::{BootHandoff, MemoryRange};
use osmium_info::layout::{
    KERNEL_HEAP_SIZE, PAGE_RECORD_BYTES, PAGE_RECORDS_BASE, PAGE_RECORDS_SIZE, TEMP_TABLE_VA,
    TEMP_WINDOW_BASE,
};
use osmium_sync::IrqLock;
use osmium_vmem::{AddressSpace, PageFaultCode, PageTable, TempMapper, TempSlots};

pub use fault::{FaultError, InterruptedContext, PanicReason, fatal};
pub use object::{FaultOutcome, VmObject};
pub use state::{NodeArena, VmConfig, VmState};

/// The singleton's concrete state type.
type KernelVm = VmState<'static, TempMapper<'static>>;

/// Temporary-mapping slots, adopted from the loader's table by [`init`].
static TEMP_SLOTS: TempSlots = TempSlots::empty();

/// The physical mapper behind every singleton operation.
static TEMP_MAPPER: TempMapper<'static> = TempMapper::new(&TEMP_SLOTS);

/// The subsystem singleton; empty until [`init`] publishes the state.
static VM: IrqLock<Option<KernelVm>> = IrqLock::new(None);

/// Node storage for the singleton's bootstrap regions.
static mut BOOT_ARENA: NodeArena = NodeArena::new();

/// Brings the subsystem up from the boot handoff and publishes the
/// singleton.
///
/// Adopts the loader's temporary-mapping table, then runs the bring-up
/// sequence of [`VmState::init`] over the handoff's range table, the active
/// root, and the fixed record window.
///
/// # Safety
///
/// Must be called exactly once, before interrupts are enabled. The handoff
/// must be live: `ranges_ptr`/`ranges_len` name an exclusively owned range
/// table, `layout.root_table` the active root, and the loader must have
/// self-mapped the temp table at its fixed address.
///
/// # Panics
///
/// Panics when bring-up fails; the kernel cannot run without its memory
/// subsystem.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn init(boot: &BootHandoff) {
    // Safety: the temp table address is a fixed nonzero constant and the
    // loader self-mapped the table there.
    unsafe {
        let table = NonNull::new_unchecked(TEMP_TABLE_VA as usize as *mut PageTable);
        TEMP_SLOTS.adopt(table, VirtualAddress::new(TEMP_WINDOW_BASE));
    }

    // Safety: the handoff transfers exclusive ownership of the range table.
    let ranges = unsafe {
        core::slice::from_raw_parts_mut(
            boot.ranges_ptr as usize as *mut MemoryRange,
            boot.ranges_len as usize,
        )
    };

    // Safety: the record window base is a fixed nonzero constant and the
    // whole window is reserved for this view.
    let records = unsafe {
        let base = NonNull::new_unchecked(PAGE_RECORDS_BASE as usize as *mut PageRecord);
        PageRecords::from_raw(base, (PAGE_RECORDS_SIZE / PAGE_RECORD_BYTES) as usize)
    };

    // The heap region starts at the image end; its bytes are the region
    // itself. Safety: the image end is inside the kernel window, never null.
    let heap_storage =
        unsafe { NonNull::new_unchecked(boot.layout.image_end as usize as *mut u8) };

    // Safety: init runs once with interrupts off; nothing else reaches the
    // arena.
    let arena = unsafe { &mut *&raw mut BOOT_ARENA };

    let root = PhysicalPage::from_addr(PhysicalAddress::new(boot.layout.root_table));
    let state = VmState::init(
        &TEMP_MAPPER,
        VmConfig {
            space: AddressSpace::new(root),
            records,
            ranges,
            arena,
            heap_storage,
            heap_size: KERNEL_HEAP_SIZE,
            layout: boot.layout.clone(),
        },
    );
    VM.with(|slot| *slot = Some(state));
}

/// Allocates one physical page.
///
/// # Panics
///
/// Panics when the request's tiers are exhausted, or before [`init`].
#[must_use]
pub fn page_alloc(request: TierRequest) -> PhysicalPage<Size4K> {
    VM.with(|slot| match live(slot).page_alloc(request) {
        Ok(page) => page,
        Err(error) => fatal(
            PanicReason::OutOfMemory,
            format_args!("page allocation failed: {error}"),
        ),
    })
}

/// Releases one reference to a page from [`page_alloc`].
///
/// # Panics
///
/// Panics before [`init`].
pub fn page_free(page: PhysicalPage<Size4K>) {
    VM.with(|slot| live(slot).page_free(page));
}

/// Reserves address space backed by `object`.
///
/// # Panics
///
/// Panics when address space or node storage is exhausted, or before
/// [`init`].
#[must_use]
pub fn vm_alloc(size: u64, object: VmObject) -> VirtualAddress {
    VM.with(|slot| match live(slot).vm_alloc(size, object) {
        Ok(address) => address,
        Err(error) => fatal(
            PanicReason::OutOfMemory,
            format_args!("region allocation of {size:#x} bytes failed: {error}"),
        ),
    })
}

/// Reserves the exact span starting at `address`, backed by `object`.
///
/// # Panics
///
/// Panics when the span collides with a live region, when node storage is
/// exhausted, or before [`init`].
#[must_use]
pub fn vm_alloc_at(address: VirtualAddress, size: u64, object: VmObject) -> VirtualAddress {
    VM.with(|slot| match live(slot).vm_alloc_at(address, size, object) {
        Ok(address) => address,
        Err(error) => fatal(
            PanicReason::OutOfMemory,
            format_args!("region placement at {address} failed: {error}"),
        ),
    })
}

/// Allocates kernel memory; page-scale requests get their own anonymous
/// region, smaller ones come from the kernel heap.
///
/// # Panics
///
/// Panics on exhaustion, or before [`init`].
#[must_use]
pub fn memory_alloc(size: u64) -> NonNull<u8> {
    VM.with(|slot| match live(slot).memory_alloc(size) {
        Ok(ptr) => ptr,
        Err(error) => fatal(
            PanicReason::OutOfMemory,
            format_args!("allocation of {size:#x} bytes failed: {error}"),
        ),
    })
}

/// Releases memory from [`memory_alloc`].
///
/// # Panics
///
/// Panics before [`init`].
pub fn memory_free(ptr: NonNull<u8>) {
    VM.with(|slot| live(slot).memory_free(ptr));
}

/// Entry point for the page-fault vector.
///
/// Resolves the fault and returns, so the interrupted access retries. An
/// unresolvable fault dumps the interrupted context and halts.
///
/// # Panics
///
/// Panics on unhandled faults and exhaustion, or before [`init`].
#[must_use]
pub fn page_fault_handler(
    code: PageFaultCode,
    address: VirtualAddress,
    frame: &InterruptedContext,
) -> FaultOutcome {
    let resolved = VM.with(|slot| live(slot).dispatch_fault(code, address));
    match resolved {
        Ok(outcome) => outcome,
        Err(error) => {
            frame.log();
            error!("page fault at {address}: {}", code.explain());
            let reason = match error {
                FaultError::OutOfMemory => PanicReason::OutOfMemory,
                FaultError::NoRegion | FaultError::NoHandler | FaultError::AccessViolation => {
                    PanicReason::UnhandledFault
                }
            };
            fatal(reason, format_args!("{error} at {address}"))
        }
    }
}

fn live(slot: &mut Option<KernelVm>) -> &mut KernelVm {
    let Some(state) = slot.as_mut() else {
        fatal(
            PanicReason::General,
            format_args!("virtual memory used before init"),
        )
    };
    state
}

/// `GlobalAlloc` adapter over the subsystem, for the kernel binary to
/// install as its `#[global_allocator]`. The workspace itself installs
/// nothing, so host tests keep the host allocator.
pub struct KernelAllocator;

// Safety: allocation routes through the interrupt-masked singleton; frees
// accept any pointer the matching alloc returned.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() as u64 > Size4K::SIZE {
            // No user needs page-multiple alignment; serving it would take
            // an aligned region carve-out.
            return core::ptr::null_mut();
        }
        // The heap aligns to 16, regions to a page; bump the size so the
        // coarser source serves finer alignments.
        let size = if layout.align() > 16 {
            (layout.size() as u64).max(Size4K::SIZE)
        } else {
            layout.size() as u64
        };
        VM.with(|slot| match live(slot).memory_alloc(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => core::ptr::null_mut(),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Block sizes live in the heap's own headers; the layout is not
        // consulted.
        if let Some(ptr) = NonNull::new(ptr) {
            VM.with(|slot| live(slot).memory_free(ptr));
        }
    }
}
