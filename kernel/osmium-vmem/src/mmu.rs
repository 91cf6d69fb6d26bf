//! Privileged MMU register access.
//!
//! Everything here executes ring-0 instructions; the module only exists on
//! x86-64 builds and host tests never call into it. The walk code reaches
//! hardware state exclusively through these four functions, keeping the
//! privileged surface in one place.

use bitfield_struct::bitfield;
use osmium_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use osmium_sync::IrqGuard;

/// CR3: the physical root of the active hierarchy plus its caching policy.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Ignored by hardware (PCID disabled).
    #[bits(3)]
    __ignored_low: u8,
    /// Write-through caching for accesses to the root table.
    pub write_through: bool,
    /// Cache disable for accesses to the root table.
    pub cache_disable: bool,
    /// Ignored by hardware (PCID disabled).
    #[bits(7)]
    __ignored_mid: u8,
    /// Bits 51:12 of the root table's physical address.
    #[bits(40)]
    frame: u64,
    #[bits(12)]
    __reserved: u16,
}

impl Cr3 {
    /// The root table this register value points at.
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.frame() << 12))
    }

    /// Register value selecting `root` with default caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_frame(root.base().as_u64() >> 12)
    }
}

/// Root table currently installed in CR3.
///
/// # Safety
///
/// Requires ring 0.
#[must_use]
pub unsafe fn current() -> PhysicalPage<Size4K> {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    Cr3::from_bits(value).root()
}

/// Installs `root` as the active hierarchy.
///
/// Interrupts stay masked across the write so no handler can run against a
/// half-switched space.
///
/// # Safety
///
/// Requires ring 0. `root` must be a live L4 table whose mappings cover
/// everything the currently executing code touches, including the switch
/// itself.
pub unsafe fn activate(root: PhysicalPage<Size4K>) {
    let _masked = IrqGuard::new();
    let value = Cr3::from_root(root).into_bits();
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
    }
}

/// Drops the TLB entry covering `va`.
///
/// # Safety
///
/// Requires ring 0.
pub unsafe fn invalidate(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Address whose access raised the most recent page fault (CR2).
///
/// Read it before interrupts come back on; a nested fault overwrites the
/// register.
///
/// # Safety
///
/// Requires ring 0.
#[must_use]
pub unsafe fn fault_address() -> VirtualAddress {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    VirtualAddress::new(value)
}
