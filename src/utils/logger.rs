/*
 * Transport Logging
 *
 * Minimal `log` backend for service binaries and tests. Every module of
 * the crate logs through the `log` facade; this logger prints records to
 * stderr tagged with level, pid and thread name so interleaved looper
 * output stays readable.
 *
 * Libraries embedding the transport may install any other `log` backend
 * instead.
 */

use std::io::Write;

use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Stderr logger for liteipc processes
struct IpcLogger;

impl log::Log for IpcLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{}] {}/{}: {}",
            record.level(),
            std::process::id(),
            thread.name().unwrap_or("-"),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: IpcLogger = IpcLogger;

/// Install the stderr logger with the given level filter
///
/// Fails if another logger was already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}
