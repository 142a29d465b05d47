//! Logic of a wireless MIDI amp channel switcher.
//!
//! The device pairs with a controller over ESP-NOW, listens for MIDI program
//! changes and four push buttons, and energizes one of its relay outputs.
//! Everything here is hardware independent and driven by [`device::Device`]'s
//! tick; the firmware binary only supplies the peripherals.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to the other modules.
#[doc(hidden)]
pub mod fmt;

pub mod buttons;
pub mod command;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod flash;
pub mod indicator;
pub mod link;
pub mod midi;
pub mod pairing;
pub mod router;
pub mod store;
pub mod switch;

pub use error::{Error, Result};
pub use fmt::{LogLevel, log_level, set_log_level};
