//! Process-wide logging sink.
//!
//! Matches the surrounding dependency stack's own convention of a small
//! hand-rolled sink rather than an external logging façade: a level
//! filter plus a destination, handed to every subsystem as an `Arc`
//! instead of reached for as a global static.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Alert = 1,
}

pub struct Logger {
    min_level: AtomicU8,
}

impl Logger {
    pub fn new(min_level: Level) -> Self {
        Self { min_level: AtomicU8::new(min_level as u8) }
    }

    pub fn set_level(&self, level: Level) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: Level) -> bool {
        level as u8 >= self.min_level.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let tag = match level {
            Level::Debug => "DEBUG",
            Level::Alert => "ALERT",
        };
        let _ = writeln!(std::io::stderr(), "[{}] {}", tag, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Level::Alert)
    }
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::logging::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_alert {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::logging::Level::Alert, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_level_filters_out_debug() {
        let logger = Logger::new(Level::Alert);
        assert!(!logger.enabled(Level::Debug));
        assert!(logger.enabled(Level::Alert));
    }

    #[test]
    fn debug_level_allows_everything() {
        let logger = Logger::new(Level::Debug);
        assert!(logger.enabled(Level::Debug));
        assert!(logger.enabled(Level::Alert));
    }
}
