//! Logging shim.
//!
//! The firmware logs through `defmt`; host builds go through the `log` facade.
//! Both are gated by a runtime [`LogLevel`] that the operator can change.
//! The macros are exported so the firmware binary logs through the same gate.

#![macro_use]

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::Error;

/// Runtime verbosity, ordered from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    #[default]
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => LogLevel::None,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            other => return Err(Error::InvalidLogLevel(other)),
        })
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::try_from(MAX_LEVEL.load(Ordering::Relaxed)).unwrap_or_default()
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        if $crate::fmt::enabled($crate::fmt::LogLevel::Error) {
            #[cfg(feature = "defmt")]
            ::defmt::error!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::error!($($arg)+);
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        if $crate::fmt::enabled($crate::fmt::LogLevel::Warn) {
            #[cfg(feature = "defmt")]
            ::defmt::warn!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::warn!($($arg)+);
        }
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        if $crate::fmt::enabled($crate::fmt::LogLevel::Info) {
            #[cfg(feature = "defmt")]
            ::defmt::info!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::info!($($arg)+);
        }
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        if $crate::fmt::enabled($crate::fmt::LogLevel::Debug) {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg)+);
            #[cfg(not(feature = "defmt"))]
            ::log::debug!($($arg)+);
        }
    };
}
