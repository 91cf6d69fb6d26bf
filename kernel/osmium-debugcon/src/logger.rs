use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use osmium_sync::SpinLock;

use crate::sink::DebugconSink;

/// Level ceiling used by [`DebugconLogger::default`].
pub const DEFAULT_MAX_LEVEL: LevelFilter = LevelFilter::Info;

/// A `log::Log` backend that frames records onto the debug console.
///
/// One record becomes one line, `[LEVEL] target: message`. The sink is
/// guarded by a spin lock so records from concurrent writers (host test
/// threads, or a future second hardware thread) never interleave mid-line.
pub struct DebugconLogger {
    max_level: LevelFilter,
    sink: SpinLock<DebugconSink>,
}

impl DebugconLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            sink: SpinLock::new(DebugconSink),
        }
    }

    /// Call this once during early init.
    #[allow(
        static_mut_refs,
        clippy::missing_errors_doc,
        clippy::missing_panics_doc
    )]
    pub fn init(self) -> Result<(), SetLoggerError> {
        // SAFETY: log::set_logger expects &'static Log; a static holds the
        // logger without allocating. Init runs once, before any logging.
        static mut LOGGER: Option<DebugconLogger> = None;

        unsafe {
            LOGGER = Some(self);
            log::set_logger(LOGGER.as_ref().unwrap() as &'static dyn Log)?;
        }
        log::set_max_level(LevelFilter::Trace);
        Ok(())
    }
}

impl Default for DebugconLogger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVEL)
    }
}

impl Log for DebugconLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        self.sink.with_lock(|sink| {
            let _ = writeln!(
                sink,
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        });
    }

    fn flush(&self) {
        // nothing buffered
    }
}
