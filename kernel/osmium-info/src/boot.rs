//! # Loader Handoff Records
//!
//! Everything the memory subsystem learns from the loader, it learns here,
//! once, at init. Keep these `#[repr(C)]` and prefer fixed-size integers
//! over pointer types at the handoff boundary.

/// Classification tag for one physical memory range.
///
/// The discriminants match the loader's table format exactly; do not
/// reorder. We avoid Rust enums with payloads across the handoff boundary.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRangeKind {
    /// Broken or absent memory. Never touched.
    Unusable = 0,
    /// Loader- or kernel-occupied memory that stays allocated forever.
    Reserved = 1,
    /// Memory holding firmware structures the kernel keeps (e.g. ACPI NVS).
    System = 2,
    /// General-purpose RAM, free for allocation.
    Available = 3,
    /// Firmware-claimed memory that may be reclaimed later. Not RAM we manage.
    Firmware = 4,
    /// Memory-mapped device registers. Not RAM at all.
    Mmio = 5,
}

impl MemoryRangeKind {
    /// Human-readable tag for boot-time logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unusable => "unusable",
            Self::Reserved => "reserved",
            Self::System => "system",
            Self::Available => "available",
            Self::Firmware => "firmware",
            Self::Mmio => "mmio",
        }
    }
}

/// One physical memory range from the loader's map.
///
/// Ranges are half-open byte spans `[base, base + size)`. The loader
/// guarantees they are sorted by base and do not overlap; it does *not*
/// guarantee page alignment for firmware-reported ranges.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRange {
    /// Classification of the range.
    pub kind: MemoryRangeKind,

    /// Physical base address in bytes.
    pub base: u64,

    /// Length in bytes. May be zero after the early allocator drained it.
    pub size: u64,
}

impl MemoryRange {
    /// Creates a range record.
    #[must_use]
    pub const fn new(kind: MemoryRangeKind, base: u64, size: u64) -> Self {
        Self { kind, base, size }
    }

    /// Exclusive end address of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// Placement facts about the running image, from the loader.
///
/// Virtual addresses here refer to mappings the loader already established
/// in the active root table; the memory subsystem registers them as regions
/// but never re-maps them.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct BootLayout {
    /// First virtual address of the kernel image.
    pub image_base: u64,

    /// One past the last virtual address of the kernel image (page aligned).
    pub image_end: u64,

    /// Lowest virtual address of the boot stack guardless span.
    pub stack_base: u64,

    /// Boot stack length in bytes.
    pub stack_size: u64,

    /// Physical address of the active level-4 root table.
    ///
    /// Inherited from the loader purely for its high-half mappings; the
    /// low-half identity mappings are dead weight the kernel ignores.
    pub root_table: u64,

    /// Physical address of the page backing the temporary-mapping table.
    ///
    /// The loader installed this level-1 table with its own entry 511
    /// pointing at itself, which is what makes the table reachable at a
    /// fixed virtual address before any allocator exists.
    pub temp_table: u64,
}

/// The complete loader handoff consumed by the memory subsystem's init.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct BootHandoff {
    /// Pointer to the loader's array of [`MemoryRange`] records.
    ///
    /// The array must stay writable and live for the rest of the kernel's
    /// lifetime; the early allocator shrinks ranges in place.
    pub ranges_ptr: u64,

    /// Number of records in the range array.
    pub ranges_len: u64,

    /// Image, stack and paging placement facts.
    pub layout: BootLayout,
}
