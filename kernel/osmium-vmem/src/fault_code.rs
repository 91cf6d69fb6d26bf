//! The page-fault error code pushed by the hardware.

use bitfield_struct::bitfield;

/// Error code of vector 14, as the CPU pushes it.
///
/// Only the five architectural bits this subsystem dispatches on are named;
/// the rest of the word is carried through untouched for diagnostics.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultCode {
    /// Clear: the translation was absent. Set: it was present and the
    /// access violated its permissions.
    pub present: bool,
    /// The faulting access was a write.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// A reserved bit was set somewhere in the walk; the tables themselves
    /// are corrupt.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    /// Remaining architectural and reserved bits (PK, SS, SGX, ...).
    #[bits(59)]
    __rest: u64,
}

impl PageFaultCode {
    /// One-line classification for fault diagnostics.
    #[must_use]
    pub const fn explain(self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in paging structures"
        } else if self.instruction_fetch() {
            if self.present() {
                "instruction fetch from non-executable mapping"
            } else {
                "instruction fetch from unmapped address"
            }
        } else if self.present() {
            if self.write() {
                "write to read-only mapping"
            } else {
                "read protection violation"
            }
        } else if self.write() {
            "write to unmapped address"
        } else {
            "read from unmapped address"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_sit_where_the_hardware_puts_them() {
        let code = PageFaultCode::from_bits(0b1_1011);
        assert!(code.present());
        assert!(code.write());
        assert!(!code.user());
        assert!(code.reserved_bit());
        assert!(code.instruction_fetch());
        assert_eq!(code.into_bits(), 0b1_1011);
    }

    #[test]
    fn explain_covers_the_dispatch_relevant_combos() {
        let not_present_read = PageFaultCode::new();
        assert_eq!(not_present_read.explain(), "read from unmapped address");

        let not_present_write = PageFaultCode::new().with_write(true);
        assert_eq!(not_present_write.explain(), "write to unmapped address");

        let cow_style = PageFaultCode::new().with_present(true).with_write(true);
        assert_eq!(cow_style.explain(), "write to read-only mapping");

        let nx = PageFaultCode::new()
            .with_present(true)
            .with_instruction_fetch(true);
        assert_eq!(nx.explain(), "instruction fetch from non-executable mapping");

        let corrupt = PageFaultCode::new()
            .with_present(true)
            .with_reserved_bit(true);
        assert_eq!(corrupt.explain(), "reserved bit set in paging structures");
    }
}
