//! Virtual address space constants.
//!
//! Everything here is a compile-time constant; the assertions at the bottom
//! of the module keep the windows ordered and aligned relative to each other
//! so a careless edit cannot silently overlap two reservations.

/// Base of the kernel image window: the top 2 GiB of the address space.
///
/// The loader links and maps the kernel image starting here. The kernel heap
/// follows the image end at runtime.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Span of the kernel image window (2 GiB, matching the loader's alignment
/// guarantee).
pub const KERNEL_SPAN: u64 = 2 * 1024 * 1024 * 1024;

/// Byte size of one physical page record.
///
/// Must match `size_of::<PageRecord>()` in the frame allocator; checked by a
/// unit test there since this crate stays free of type dependencies.
pub const PAGE_RECORD_BYTES: u64 = 8;

/// Span of the reserved physical page record window (4 GiB).
///
/// At 8 bytes per record this tracks up to 2 TiB of physical memory.
pub const PAGE_RECORDS_SIZE: u64 = 1 << 32;

/// Base of the physical page record array, directly below the kernel image.
///
/// The window is reserved, never eagerly mapped: records materialize on
/// first write through the demand-paging path they themselves support.
pub const PAGE_RECORDS_BASE: u64 = KERNEL_BASE - PAGE_RECORDS_SIZE;

/// Base of the temporary mapping window: the top 2 MiB of the address space.
///
/// Served by a single always-present level-1 table; each 4 KiB slot in the
/// window is one entry of that table.
pub const TEMP_WINDOW_BASE: u64 = 0u64.wrapping_sub(2 * 1024 * 1024);

/// Virtual address of the temporary-mapping level-1 table itself.
///
/// The loader self-maps the table through its own entry 511, which is why
/// slot 511 can never be handed out as a scratch mapping.
pub const TEMP_TABLE_VA: u64 = 0u64.wrapping_sub(4096);

/// Number of allocatable temporary mapping slots (indices `0..511`).
pub const TEMP_SLOT_COUNT: usize = 511;

/// Size of the kernel heap region placed directly after the image
/// (16 large pages, 32 MiB).
pub const KERNEL_HEAP_SIZE: u64 = 16 * 2 * 1024 * 1024;

const _: () = {
    // The record window must end exactly where the kernel image begins.
    assert!(PAGE_RECORDS_BASE + PAGE_RECORDS_SIZE == KERNEL_BASE);
    // Kernel window alignment per the loader contract.
    assert!(KERNEL_BASE % KERNEL_SPAN == 0);
    // The temp window lies inside the kernel window and its table address is
    // the window's own slot 511.
    assert!(TEMP_WINDOW_BASE > KERNEL_BASE);
    assert!(TEMP_TABLE_VA == TEMP_WINDOW_BASE + 511 * 4096);
    // The heap must fit between image base and the temp window even if the
    // image filled half of its window.
    assert!(KERNEL_BASE + KERNEL_SPAN / 2 + KERNEL_HEAP_SIZE < TEMP_WINDOW_BASE);
};
