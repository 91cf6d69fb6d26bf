//! Fault taxonomy and the diagnostic context for fatal paths.

use core::fmt;

use log::error;
use thiserror::Error;

/// Why the kernel is halting.
///
/// The kind is part of the panic message so postmortem logs distinguish the
/// unrecoverable conditions from one another. The exception dispatcher uses
/// [`DeadEnd`](Self::DeadEnd) for control flow that must never be reached.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PanicReason {
    /// An explicit invariant check failed.
    General,
    /// A fault no region resolves, or a resolvable region could not
    /// resolve it.
    UnhandledFault,
    /// Physical memory or address space ran out; nothing in the kernel can
    /// shed load.
    OutOfMemory,
    /// Control reached code that must be unreachable.
    DeadEnd,
}

impl PanicReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "kernel panic",
            Self::UnhandledFault => "unhandled fault",
            Self::OutOfMemory => "out of memory",
            Self::DeadEnd => "dead end reached",
        }
    }
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logs the reason and halts.
///
/// Every fatal condition in the subsystem funnels through here so the
/// reason and message reach the log backend before the panic unwinds into
/// the kernel's panic handler.
pub fn fatal(reason: PanicReason, message: fmt::Arguments<'_>) -> ! {
    error!("{reason}: {message}");
    panic!("{reason}: {message}");
}

/// Why fault dispatch could not resolve a fault.
///
/// The library reports these; the kernel-facing entry point turns them into
/// a [`fatal`] halt, and tests assert on them directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum FaultError {
    /// No region owns the faulting address.
    #[error("no region owns the address")]
    NoRegion,
    /// The owning region's backing kind has no resolution path.
    #[error("the owning region does not resolve faults")]
    NoHandler,
    /// The owning region resolves faults, but not this access; the fault
    /// reports a permission the mapping legitimately denies.
    #[error("access violates the established mapping")]
    AccessViolation,
    /// Resolving the fault needed a physical frame and none was left.
    #[error("no physical frame left to resolve the fault")]
    OutOfMemory,
}

/// Register snapshot saved by the interrupt entry stub.
///
/// Layout contract with the assembly stub: the stub pushes the callee-saved
/// registers, the remaining caller-saved registers, then the parameter
/// registers on top of the hardware's interrupt record, and passes the
/// resulting stack pointer here. Field order is push order; keep it in sync
/// with the stub.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InterruptedContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub rax: u64,
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    /// Interrupt vector number, pushed by the per-vector stub.
    pub vector: u64,
    /// Hardware error code, or zero for vectors that push none.
    pub code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
}

impl InterruptedContext {
    /// Writes the snapshot to the log, grouped the way the exception
    /// dispatcher prints every fatal trap.
    pub fn log(&self) {
        error!(
            "interrupted at rip={:#018x} cs={:#06x} rflags={:#018x} (vector {}, code {:#x})",
            self.rip, self.cs, self.rflags, self.vector, self.code
        );
        error!(
            "  rdi={:#018x} rsi={:#018x} rdx={:#018x} rcx={:#018x} r8={:#018x} r9={:#018x}",
            self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9
        );
        error!(
            "  rax={:#018x} r10={:#018x} r11={:#018x}",
            self.rax, self.r10, self.r11
        );
        error!(
            "  rbx={:#018x} rbp={:#018x} r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            self.rbx, self.rbp, self.r12, self.r13, self.r14, self.r15
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn context_layout_matches_the_stub_push_order() {
        // 15 pushed registers + vector + code + 3 hardware fields.
        assert_eq!(size_of::<InterruptedContext>(), 20 * 8);
        assert_eq!(offset_of!(InterruptedContext, r15), 0);
        assert_eq!(offset_of!(InterruptedContext, rbx), 5 * 8);
        assert_eq!(offset_of!(InterruptedContext, rax), 8 * 8);
        assert_eq!(offset_of!(InterruptedContext, rdi), 14 * 8);
        assert_eq!(offset_of!(InterruptedContext, vector), 15 * 8);
        assert_eq!(offset_of!(InterruptedContext, rflags), 19 * 8);
    }

    #[test]
    fn panic_reasons_render_distinctly() {
        let reasons = [
            PanicReason::General,
            PanicReason::UnhandledFault,
            PanicReason::OutOfMemory,
            PanicReason::DeadEnd,
        ];
        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }
}
