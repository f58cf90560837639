//! Log setup shared by the keymount binaries.
//!
//! Errors and warnings always reach syslog (AUTHPRIV, like the rest of the
//! login stack). stderr mirroring is gated on the requested level so that
//! debug chatter only appears when an operator asks for it.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::Mutex;
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};

struct KeymountLogger {
    stderr_level: LevelFilter,
    syslog: Option<Mutex<Logger<LoggerBackend, Formatter3164>>>,
}

impl Log for KeymountLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LevelFilter::Debug
    }

    fn log(&self, record: &Record) {
        if record.level() <= self.stderr_level {
            eprintln!("keymount: {}", record.args());
        }

        if let Some(sink) = &self.syslog {
            let message = record.args().to_string();
            if let Ok(mut logger) = sink.lock() {
                let _ = match record.level() {
                    Level::Error => logger.err(message),
                    Level::Warn => logger.warning(message),
                    Level::Info => logger.info(message),
                    Level::Debug | Level::Trace => logger.debug(message),
                };
            }
        }
    }

    fn flush(&self) {}
}

/// Install the process-wide logger.
///
/// `level` selects how much reaches stderr (`"error"`, `"warn"`, `"info"`,
/// `"debug"`); syslog always receives everything at warn and above, and the
/// full stream when debugging is on.
pub fn init(level: &str) {
    let stderr_level = match level {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        _ => LevelFilter::Error,
    };

    let formatter = Formatter3164 {
        facility: Facility::LOG_AUTHPRIV,
        hostname: None,
        process: "keymount".into(),
        pid: std::process::id(),
    };

    let syslog = syslog::unix(formatter).ok().map(Mutex::new);

    let max = if stderr_level > LevelFilter::Warn {
        stderr_level
    } else {
        LevelFilter::Warn
    };

    if log::set_boxed_logger(Box::new(KeymountLogger {
        stderr_level,
        syslog,
    }))
    .is_ok()
    {
        log::set_max_level(max);
    }
}
