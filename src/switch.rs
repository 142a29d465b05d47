//! Exclusive relay selection.

use crate::error::{Error, Result};

/// The relay lines, addressed by zero-based index.
pub trait RelayDriver {
    fn set_energized(&mut self, line: usize, energized: bool);
}

/// Keeps at most one relay energized. Channel 0 means all off.
#[derive(Debug)]
pub struct ChannelSwitch<R> {
    relays: R,
    outputs: usize,
    active: u8,
}

impl<R: RelayDriver> ChannelSwitch<R> {
    /// Take over the relays and de-energize every line.
    pub fn new(mut relays: R, outputs: usize) -> Self {
        for line in 0..outputs {
            relays.set_energized(line, false);
        }
        Self {
            relays,
            outputs,
            active: 0,
        }
    }

    pub fn active(&self) -> u8 {
        self.active
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn relays(&self) -> &R {
        &self.relays
    }

    /// Energize `channel` (1-based) after de-energizing the current one.
    /// Returns `false` when it was already active.
    pub fn select(&mut self, channel: u8) -> Result<bool> {
        if usize::from(channel) > self.outputs {
            return Err(Error::InvalidOutputChannel(channel));
        }
        if channel == self.active {
            return Ok(false);
        }
        if self.active != 0 {
            self.relays
                .set_energized(usize::from(self.active - 1), false);
        }
        if channel != 0 {
            self.relays.set_energized(usize::from(channel - 1), true);
        }
        debug!("[switch] channel {} -> {}", self.active, channel);
        self.active = channel;
        Ok(true)
    }

    pub fn off(&mut self) -> bool {
        self.select(0).unwrap_or(false)
    }

    /// Single-output behavior: flip channel 1.
    pub fn toggle(&mut self) -> bool {
        let target = if self.active == 0 { 1 } else { 0 };
        self.select(target).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Relays {
        lines: [bool; 4],
        writes: std::vec::Vec<(usize, bool)>,
    }

    impl RelayDriver for Relays {
        fn set_energized(&mut self, line: usize, energized: bool) {
            // Never two lines energized at once, even mid-switch.
            if energized {
                assert!(self.lines.iter().all(|on| !on));
            }
            self.lines[line] = energized;
            self.writes.push((line, energized));
        }
    }

    #[test]
    fn exactly_one_line_after_each_selection() {
        let mut switch = ChannelSwitch::new(Relays::default(), 4);
        for channel in 1..=4u8 {
            assert_eq!(switch.select(channel), Ok(true));
            let on: std::vec::Vec<_> = (0..4).filter(|&i| switch.relays().lines[i]).collect();
            assert_eq!(on, [usize::from(channel - 1)]);
        }
    }

    #[test]
    fn reselecting_is_a_no_op() {
        let mut switch = ChannelSwitch::new(Relays::default(), 4);
        switch.select(2).unwrap();
        let before = switch.relays().writes.len();
        assert_eq!(switch.select(2), Ok(false));
        assert_eq!(switch.relays().writes.len(), before);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut switch = ChannelSwitch::new(Relays::default(), 4);
        switch.select(1).unwrap();
        assert_eq!(switch.select(5), Err(Error::InvalidOutputChannel(5)));
        assert_eq!(switch.active(), 1);
    }

    #[test]
    fn off_and_toggle() {
        let mut switch = ChannelSwitch::new(Relays::default(), 1);
        assert!(switch.toggle());
        assert_eq!(switch.active(), 1);
        assert!(switch.toggle());
        assert_eq!(switch.active(), 0);
        assert!(!switch.off());
    }
}
