//! Leveled logging with two independently thresholded sinks: stderr and an
//! optional user callback. Thresholds live in atomics so that log calls never
//! touch the global state lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Disable = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_u8(x: u8) -> LogLevel {
        match x {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Disable,
        }
    }

    const fn tag(self) -> &'static str {
        match self {
            LogLevel::Disable => "",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

pub type LogCallback = fn(LogLevel, &str);

static LEVEL_STDERR: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static LEVEL_CALLBACK: AtomicU8 = AtomicU8::new(LogLevel::Disable as u8);
static CALLBACK: Mutex<Option<LogCallback>> = Mutex::new(None);

/// Threshold of the stderr sink.
pub fn set_log_level_stderr(level: LogLevel) {
    LEVEL_STDERR.store(level as u8, Ordering::Relaxed);
}

pub fn log_level_stderr() -> LogLevel {
    LogLevel::from_u8(LEVEL_STDERR.load(Ordering::Relaxed))
}

/// Install a callback sink with its own threshold. Passing `None` removes it.
pub fn set_log_callback(level: LogLevel, callback: Option<LogCallback>) {
    LEVEL_CALLBACK.store(
        if callback.is_some() { level as u8 } else { LogLevel::Disable as u8 },
        Ordering::Relaxed,
    );
    *CALLBACK.lock().unwrap() = callback;
}

pub fn log_level_callback() -> LogLevel {
    LogLevel::from_u8(LEVEL_CALLBACK.load(Ordering::Relaxed))
}

/// Highest threshold of either sink. Callers use this to skip building
/// expensive messages nobody will see.
pub(crate) fn max_level() -> LogLevel {
    log_level_stderr().max(log_level_callback())
}

/// Write one message, tagged with the originating subsystem.
pub(crate) fn log(level: LogLevel, subsystem: &str, msg: &str) {
    if level <= log_level_stderr() {
        eprintln!("jit/{subsystem} [{}]: {msg}", level.tag());
    }
    if level <= log_level_callback() {
        let cb = *CALLBACK.lock().unwrap();
        if let Some(cb) = cb {
            cb(level, msg);
        }
    }
}

/// `jit_log!(Level, "subsystem", "fmt", args..)`
macro_rules! jit_log {
    ($level:ident, $subsystem:expr, $($arg:tt)*) => {
        if $crate::log::LogLevel::$level <= $crate::log::max_level() {
            $crate::log::log(
                $crate::log::LogLevel::$level,
                $subsystem,
                &format!($($arg)*),
            );
        }
    };
}

pub(crate) use jit_log;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
    }
}
