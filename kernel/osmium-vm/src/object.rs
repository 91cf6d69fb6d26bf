//! What backs a region of virtual address space.

use core::fmt;

/// Backing kind of one region.
///
/// A closed set: fault dispatch matches on the kind, so a region can never
/// carry behavior this module does not know about. Exactly one kind,
/// [`Anonymous`](Self::Anonymous), resolves faults; touching any other kind
/// outside its established mappings is fatal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmObject {
    /// Address space that is occupied but not backed by this subsystem:
    /// the kernel image, which the loader mapped, and the temporary-mapping
    /// window, which manages its own table. Faults here are bugs.
    Null,
    /// Memory mapped one-to-one to its physical address.
    Direct,
    /// A definite physical range mapped at an offset.
    Translation,
    /// Memory with no physical location until it is touched. Pages
    /// materialize on first access via the zero page and become private on
    /// first write.
    Anonymous,
}

impl VmObject {
    /// Whether the fault dispatcher has a resolution path for this kind.
    #[must_use]
    pub const fn handles_faults(self) -> bool {
        matches!(self, Self::Anonymous)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Direct => "direct",
            Self::Translation => "translation",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a handled page fault was resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// First touch of an anonymous page: the shared zero page now backs it
    /// read-only.
    ZeroMapped,
    /// Write to a zero-page view: a private writable frame now backs the
    /// page, zero-filled.
    Promoted,
}
