//! Interrupt masking: the flag primitives, the RAII [`IrqGuard`], and the
//! [`IrqLock`] container for state owned by a single hardware thread.
//!
//! # Platform
//!
//! On a bare-metal x86-64 target these use `pushfq/pop`, `cli` and `sti`
//! and must run at a privilege level where those are legal. Hosted builds
//! (the test suite) substitute a process-global flag word with the same
//! semantics, so guard nesting and restoration stay fully testable.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// `RFLAGS` interrupt-enable bit.
const IF_BIT: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod flags {
    use super::IF_BIT;

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    pub fn read() -> u64 {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }

    /// Disables hardware interrupts (`cli`).
    #[inline]
    pub fn mask() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    #[inline]
    pub fn unmask() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    // referenced so the hosted and bare-metal modules stay in surface lockstep
    #[allow(dead_code)]
    const _: u64 = IF_BIT;
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod flags {
    use super::IF_BIT;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Hosted stand-in for `RFLAGS`; starts with interrupts "enabled".
    static FLAGS: AtomicU64 = AtomicU64::new(IF_BIT);

    #[inline]
    pub fn read() -> u64 {
        FLAGS.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn mask() {
        FLAGS.fetch_and(!IF_BIT, Ordering::SeqCst);
    }

    #[inline]
    pub fn unmask() {
        FLAGS.fetch_or(IF_BIT, Ordering::SeqCst);
    }
}

/// Whether hardware interrupts are currently enabled (IF=1).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    flags::read() & IF_BIT != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// masks them. On drop, it unmasks **only** if they were previously enabled,
/// so guards nest correctly.
///
/// # Examples
///
/// ```
/// use osmium_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            flags::mask();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            flags::unmask();
        }
    }
}

/// Holder for state mutated only under masked interrupts.
///
/// The memory subsystem has exactly one hardware thread per processor and
/// exactly one writer for its paging state; what it must exclude is an
/// interrupt handler observing a half-finished mutation. `with` masks
/// interrupts for the closure's duration and hands out the only `&mut T`
/// in existence.
///
/// # Contract
///
/// A single hardware thread owns the lock. Code running under `with` must
/// not call `with` on the same lock again; doing so would alias the
/// exclusive borrow, and the lock treats it as a structural violation and
/// panics rather than hand out a second `&mut T`.
///
/// # Examples
///
/// ```
/// use osmium_sync::IrqLock;
///
/// static COUNTER: IrqLock<u64> = IrqLock::new(0);
///
/// COUNTER.with(|c| *c += 1);
/// assert_eq!(COUNTER.with(|c| *c), 1);
/// ```
pub struct IrqLock<T> {
    /// Set while a `with` closure is running; re-entry detection.
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: `with` serializes all access behind the borrow flag plus masked
// interrupts; only T: Send may cross threads.
unsafe impl<T: Send> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Masks interrupts and runs `f` with exclusive access to the value.
    ///
    /// # Panics
    ///
    /// Panics if called while another `with` on the same lock is already
    /// running; that would alias the exclusive borrow.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _irq = IrqGuard::new();
        if self
            .borrowed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("IrqLock re-entered");
        }
        let release = ReleaseOnDrop {
            borrowed: &self.borrowed,
        };
        let result = f(unsafe { &mut *self.value.get() });
        drop(release);
        result
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consumes the lock, returning the value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Clears the borrow flag even if the closure unwinds.
struct ReleaseOnDrop<'a> {
    borrowed: &'a AtomicBool,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.borrowed.store(false, Ordering::Release);
    }
}
