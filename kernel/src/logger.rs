//! Console-backed `log` facade implementation.
//!
//! Subsystems report through the standard `log` macros; this backend
//! formats `[LEVEL] target: message` lines and pushes them out through
//! the locked console path.

use log::{LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::printk!(
            "[{:<5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the logger at `Info`. Safe to call more than once; only the
/// first installation takes.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the runtime log ceiling.
pub fn set_max_level(level: LevelFilter) {
    log::set_max_level(level);
}
