//! Line-oriented operator commands.

use thiserror::Error;

use crate::fmt::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Help,
    Status,
    /// Forget the controller and scan again.
    Pair,
    SetLog(LogLevel),
    /// Explain the channel-select gesture and show the MIDI channel.
    ChannelSelect,
    /// Energize an output channel (1-based). Range is checked by the device.
    SetChannel(u8),
    Off,
    /// Simulated short press of a button (0-based).
    PressButton(usize),
    Ota,
    Reset,
    Debug,
    Perf,
    Memory,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command")]
    Unknown,
    #[error("log level must be 0-4")]
    InvalidLogLevel,
}

pub const HELP: &str = "\
Commands:
  help      : Show this list
  status    : Show link, channel and MIDI state
  pair      : Clear pairing and scan for the controller
  setlog N  : Set log level (0=none 1=error 2=warn 3=info 4=debug)
  chsel     : Channel-select instructions
  1..N      : Select output channel
  off       : Turn all outputs off
  bN        : Simulate a press of button N
  ota       : Enter firmware update mode
  reset     : Restart the device
  debug     : Full diagnostics
  perf      : Loop timing
  memory    : Heap usage and leak analysis
  map       : Program change map";

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        const VERBS: [(&str, Command); 11] = [
            ("help", Command::Help),
            ("status", Command::Status),
            ("pair", Command::Pair),
            ("chsel", Command::ChannelSelect),
            ("off", Command::Off),
            ("ota", Command::Ota),
            ("reset", Command::Reset),
            ("debug", Command::Debug),
            ("perf", Command::Perf),
            ("memory", Command::Memory),
            ("map", Command::Map),
        ];
        if let Some((_, command)) = VERBS.iter().find(|(verb, _)| line.eq_ignore_ascii_case(verb)) {
            return Ok(*command);
        }

        if let Some(rest) = strip_prefix_ignore_case(line, "setlog") {
            let level = rest
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(|raw| LogLevel::try_from(raw).ok())
                .ok_or(ParseError::InvalidLogLevel)?;
            return Ok(Command::SetLog(level));
        }
        if let Some(rest) = strip_prefix_ignore_case(line, "b") {
            return match rest.parse::<usize>() {
                Ok(button @ 1..) => Ok(Command::PressButton(button - 1)),
                _ => Err(ParseError::Unknown),
            };
        }
        match line.parse::<u8>() {
            Ok(channel) if channel > 0 => Ok(Command::SetChannel(channel)),
            _ => Err(ParseError::Unknown),
        }
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(Command::parse("HELP"), Ok(Command::Help));
        assert_eq!(Command::parse("  Status \r"), Ok(Command::Status));
        assert_eq!(Command::parse("OTA"), Ok(Command::Ota));
        assert_eq!(Command::parse("map"), Ok(Command::Map));
    }

    #[test]
    fn setlog_accepts_both_spellings() {
        assert_eq!(Command::parse("setlog 4"), Ok(Command::SetLog(LogLevel::Debug)));
        assert_eq!(Command::parse("setlog0"), Ok(Command::SetLog(LogLevel::None)));
        assert_eq!(Command::parse("setlog 5"), Err(ParseError::InvalidLogLevel));
        assert_eq!(Command::parse("setlog"), Err(ParseError::InvalidLogLevel));
    }

    #[test]
    fn channels_and_buttons() {
        assert_eq!(Command::parse("3"), Ok(Command::SetChannel(3)));
        assert_eq!(Command::parse("9"), Ok(Command::SetChannel(9)));
        assert_eq!(Command::parse("0"), Err(ParseError::Unknown));
        assert_eq!(Command::parse("b1"), Ok(Command::PressButton(0)));
        assert_eq!(Command::parse("B4"), Ok(Command::PressButton(3)));
        assert_eq!(Command::parse("b0"), Err(ParseError::Unknown));
        assert_eq!(Command::parse("bogus"), Err(ParseError::Unknown));
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
    }

    #[test]
    fn multibyte_input_does_not_panic() {
        assert_eq!(Command::parse("é"), Err(ParseError::Unknown));
        assert_eq!(Command::parse("séttings"), Err(ParseError::Unknown));
    }
}
