use embassy_time::Duration;

use crate::error::{Error, Result};

/// Number of relay lines (and channel buttons) the board is built for.
pub const MAX_OUTPUTS: usize = 4;
/// Wireless channels scanned while pairing.
pub const RADIO_CHANNELS: u8 = 13;
pub const MIDI_CHANNELS: u8 = 16;
/// Schema version written into every persistent namespace.
pub const STORAGE_VERSION: u32 = 1;
/// Identifier carried in outgoing pairing requests. The controller uses 0.
pub const BOARD_ID: u8 = 1;
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEVICE_NAME: &str = match option_env!("AMP_SWITCHER_DEVICE_NAME") {
    Some(name) => name,
    None => "ESP32_CLIENT",
};

/// Ascending hold ladder: 5 s, 10 s, 15 s, 20 s, 25 s, 30 s.
pub const DEFAULT_HOLD_THRESHOLDS: [Duration; 6] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(20),
    Duration::from_secs(25),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Relay lines in use. A single output switches to toggle semantics.
    pub output_count: usize,
    /// Channel energized at boot, 0 for none.
    pub boot_channel: u8,
    pub debounce: Duration,
    pub hold_thresholds: [Duration; 6],
    /// The only button that runs the hold ladder.
    pub ladder_button: usize,
    pub channel_select_timeout: Duration,
    pub learn_timeout: Duration,
    pub learn_cooldown: Duration,
    pub pairing_reply_timeout: Duration,
    pub update_mode_timeout: Duration,
    pub memory_check_interval: Duration,
    pub low_memory_threshold: usize,
    pub device_name: &'static str,
    pub board_id: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_count: MAX_OUTPUTS,
            boot_channel: 1,
            debounce: Duration::from_millis(50),
            hold_thresholds: DEFAULT_HOLD_THRESHOLDS,
            ladder_button: 0,
            channel_select_timeout: Duration::from_secs(8),
            learn_timeout: Duration::from_secs(10),
            learn_cooldown: Duration::from_millis(2000),
            pairing_reply_timeout: Duration::from_millis(1000),
            update_mode_timeout: Duration::from_secs(5 * 60),
            memory_check_interval: Duration::from_secs(30),
            low_memory_threshold: 10_000,
            device_name: DEVICE_NAME,
            board_id: BOARD_ID,
        }
    }
}

impl Config {
    /// Build for a board with a single relay: short presses and matched
    /// program changes toggle it instead of selecting.
    pub fn single_output() -> Self {
        Self {
            output_count: 1,
            ..Self::default()
        }
    }

    pub fn is_single_output(&self) -> bool {
        self.output_count == 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_count == 0 || self.output_count > MAX_OUTPUTS {
            return Err(Error::InvalidConfig("output count must be 1..=4"));
        }
        if usize::from(self.boot_channel) > self.output_count {
            return Err(Error::InvalidConfig("boot channel exceeds output count"));
        }
        if self.ladder_button >= self.output_count {
            return Err(Error::InvalidConfig("ladder button exceeds output count"));
        }
        if self.debounce == Duration::from_ticks(0) {
            return Err(Error::InvalidConfig("debounce window must be non-zero"));
        }
        if self.hold_thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::InvalidConfig("hold ladder must be strictly ascending"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::single_output().validate(), Ok(()));
    }

    #[test]
    fn rejects_unsorted_ladder() {
        let mut config = Config::default();
        config.hold_thresholds.swap(1, 2);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_output_count_out_of_range() {
        let config = Config {
            output_count: 5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            output_count: 0,
            boot_channel: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
