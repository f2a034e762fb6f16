/// `log` backend writing to the boot console.
///
/// Lines look like `[INFO ember_kernel::boot] message`. The logger's state
/// lives in `.bss`, so it is installed after ZERO_BSS; records emitted
/// earlier are dropped.
use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut console = crate::arch::console::CONSOLE.lock();
        let _ = writeln!(console, "[{} {}] {}", level, record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the logger. A second call only changes the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
