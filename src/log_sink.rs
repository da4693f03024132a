//! Installs a [`log::Log`] sink over the serial port.
//!
//! Subsystems log through the standard `log` facade (`log::trace!`,
//! `log::debug!`, ...) rather than ad-hoc `serial_println!` calls, so log
//! level filtering and per-target routing work the same way a hosted
//! service's logging would.

use log::{LevelFilter, Log, Metadata, Record};

use crate::serial_println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial_println!(
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(debug_assertions)]
const fn max_level() -> LevelFilter {
    LevelFilter::Trace
}

#[cfg(not(debug_assertions))]
const fn max_level() -> LevelFilter {
    LevelFilter::Info
}

/// Install the serial-backed logger as the global `log` sink.
///
/// Must be called exactly once, early in boot, before any subsystem logs.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(max_level()))
        .unwrap_or(());
}
