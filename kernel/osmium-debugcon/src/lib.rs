//! # Debug Console Output
//!
//! Byte-sink logging over QEMU's `isa-debugcon` device, the only output
//! channel the memory subsystem assumes during bring-up. Writes to I/O port
//! `0xE9` appear on the host side of the emulator with no buffering and no
//! guest-visible state, which makes the port usable from the earliest init
//! code and from panic paths alike.
//!
//! ## Output path
//!
//! ```text
//! log::info! / debugcon_print!
//!     ↓
//! DebugconLogger (level filter, record framing)
//!     ↓
//! DebugconSink (fmt::Write)
//!     ↓
//! putc() → I/O port 0xE9
//!     ↓
//! host terminal / log file
//! ```
//!
//! ## Host-side capture
//!
//! ```bash
//! qemu-system-x86_64 -kernel kernel.bin -debugcon stdio
//! qemu-system-x86_64 -kernel kernel.bin -debugcon file:debug.log
//! ```
//!
//! ## Two entry points
//!
//! * [`DebugconLogger`] plugs into the `log` facade; install it once via
//!   [`DebugconLogger::init`] and use the ordinary `log` macros everywhere.
//!   Records are serialized through a spin lock so concurrent writers cannot
//!   interleave mid-line.
//! * [`debugcon_print!`] writes straight to the port with no lock and no
//!   facade. Panic handlers use it so that output still works when the
//!   logger was never installed or its lock state is suspect.
//!
//! The port write compiles only for bare-metal x86-64 builds. On every other
//! target (notably the host running unit tests) the sink degrades to a
//! no-op, so code logging through this crate links and runs everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{DEFAULT_MAX_LEVEL, DebugconLogger};

#[doc(hidden)]
pub mod sink {
    use core::fmt::{self, Write};

    /// The I/O port the `isa-debugcon` device listens on.
    const DEBUGCON_PORT: u16 = 0xE9;

    /// Write a single byte to the debug console.
    #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn putc(b: u8) {
        unsafe { outb(DEBUGCON_PORT, b) }
    }

    /// No-op stand-in for hosts and disabled builds.
    #[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn putc(_b: u8) {}

    #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, preserves_flags)
            );
        }
    }

    /// Unbuffered byte sink over the debug console port.
    pub struct DebugconSink;

    impl Write for DebugconSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                putc(b);
            }
            Ok(())
        }

        #[inline]
        fn write_char(&mut self, c: char) -> fmt::Result {
            // UTF-8 encode without allocation.
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            self.write_str(s)
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn debugcon_write(args: fmt::Arguments) {
        // Ignore errors; this is best-effort debug output.
        let _ = fmt::write(&mut DebugconSink, args);
    }
}

/// Writes formatted text directly to the debug console, bypassing the `log`
/// facade and the record lock. Intended for panic handlers and very early
/// bring-up where the logger may not be installed yet.
#[macro_export]
macro_rules! debugcon_print {
    ($($arg:tt)*) => {{
        $crate::sink::debugcon_write(core::format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::sink::DebugconSink;

    #[test]
    fn sink_accepts_str_and_char() {
        let mut sink = DebugconSink;
        assert!(sink.write_str("page fault at ").is_ok());
        assert!(sink.write_char('\u{2192}').is_ok());
        assert!(write!(sink, "{:#x}", 0xdead_be00u64).is_ok());
    }

    #[test]
    fn print_macro_formats() {
        debugcon_print!("tier {} low on pages: {} left\n", 2, 17);
        debugcon_print!("plain line\n");
    }
}
