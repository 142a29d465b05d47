//! MIDI input: channel numbers, the program-change map and the serial decoder.

use heapless::{Deque, Vec};
use midi_convert::parse::MidiTryParseSlice;
use midi_types::MidiMessage;

use crate::config::{MAX_OUTPUTS, MIDI_CHANNELS};
use crate::error::{Error, Result};

/// A MIDI listening channel, 1..=16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MidiChannel(u8);

impl Default for MidiChannel {
    fn default() -> Self {
        Self(1)
    }
}

impl MidiChannel {
    pub fn new(channel: u8) -> Result<Self> {
        if (1..=MIDI_CHANNELS).contains(&channel) {
            Ok(Self(channel))
        } else {
            Err(Error::InvalidMidiChannel(channel))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The following channel, wrapping 16 back to 1.
    pub const fn next(self) -> Self {
        Self(self.0 % MIDI_CHANNELS + 1)
    }
}

impl From<midi_types::Channel> for MidiChannel {
    fn from(channel: midi_types::Channel) -> Self {
        Self(u8::from(channel) + 1)
    }
}

/// Output slot to program-number table. Slot `i` drives output channel `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramChangeMap {
    programs: Vec<u8, MAX_OUTPUTS>,
}

impl ProgramChangeMap {
    pub fn identity(outputs: usize) -> Self {
        Self {
            programs: (0..outputs.min(MAX_OUTPUTS) as u8).collect(),
        }
    }

    pub fn from_bytes(bytes: &[u8], outputs: usize) -> Result<Self> {
        if bytes.len() != outputs {
            return Err(Error::InvalidConfig("program map length mismatch"));
        }
        if let Some(&bad) = bytes.iter().find(|&&program| program > 127) {
            return Err(Error::InvalidProgram(bad));
        }
        let programs =
            Vec::from_slice(bytes).map_err(|_| Error::InvalidConfig("program map too long"))?;
        Ok(Self { programs })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.programs
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn program(&self, slot: usize) -> Option<u8> {
        self.programs.get(slot).copied()
    }

    pub fn bind(&mut self, slot: usize, program: u8) -> Result<()> {
        if program > 127 {
            return Err(Error::InvalidProgram(program));
        }
        let entry = self
            .programs
            .get_mut(slot)
            .ok_or(Error::InvalidOutputChannel(slot as u8 + 1))?;
        *entry = program;
        Ok(())
    }

    /// First slot bound to `program`.
    pub fn slot_for(&self, program: u8) -> Option<usize> {
        self.programs.iter().position(|&p| p == program)
    }
}

const RX_BUFFER: usize = 64;

/// Frames raw serial MIDI into messages, one message per call to
/// [`MidiDecoder::next_message`].
///
/// Handles running status, ignores SysEx payloads and lets real-time bytes
/// through without disturbing a message in progress.
#[derive(Debug, Default)]
pub struct MidiDecoder {
    rx: Deque<u8, RX_BUFFER>,
    running_status: Option<u8>,
    frame: Vec<u8, 3>,
    expected: usize,
    in_sysex: bool,
    dropped: usize,
}

impl MidiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer received bytes. Bytes that do not fit are dropped and counted.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.rx.push_back(byte).is_err() {
                self.dropped += 1;
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn next_message(&mut self) -> Option<MidiMessage> {
        while let Some(byte) = self.rx.pop_front() {
            if let Some(message) = self.push(byte) {
                return Some(message);
            }
        }
        None
    }

    fn push(&mut self, byte: u8) -> Option<MidiMessage> {
        if byte >= 0xF8 {
            return MidiMessage::try_parse_slice(&[byte]).ok();
        }
        if byte & 0x80 != 0 {
            self.in_sysex = byte == 0xF0;
            self.frame.clear();
            self.running_status = (byte < 0xF0).then_some(byte);
            if self.in_sysex || byte == 0xF7 {
                self.expected = 0;
                return None;
            }
            self.expected = data_len(byte);
            // A status-only message is complete already.
            let _ = self.frame.push(byte);
            return self.complete();
        }
        if self.in_sysex {
            return None;
        }
        if self.frame.is_empty() {
            let status = self.running_status?;
            self.expected = data_len(status);
            let _ = self.frame.push(status);
        }
        if self.frame.push(byte).is_err() {
            self.frame.clear();
            return None;
        }
        self.complete()
    }

    fn complete(&mut self) -> Option<MidiMessage> {
        if self.frame.len() < self.expected + 1 {
            return None;
        }
        let message = MidiMessage::try_parse_slice(&self.frame).ok();
        self.frame.clear();
        message
    }
}

fn data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
        _ => match status {
            0xF1 | 0xF3 => 1,
            0xF2 => 2,
            _ => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use midi_types::{Channel, Note, Program, Value7};

    use super::*;

    #[test]
    fn channel_wraps_after_sixteen() {
        let mut channel = MidiChannel::new(15).unwrap();
        channel = channel.next();
        assert_eq!(channel.get(), 16);
        assert_eq!(channel.next().get(), 1);
        assert_eq!(MidiChannel::new(0), Err(Error::InvalidMidiChannel(0)));
        assert_eq!(MidiChannel::new(17), Err(Error::InvalidMidiChannel(17)));
    }

    #[test]
    fn identity_map_and_binding() {
        let mut map = ProgramChangeMap::identity(4);
        assert_eq!(map.as_bytes(), &[0, 1, 2, 3]);
        map.bind(3, 1).unwrap();
        // Duplicates are allowed, the first slot wins.
        assert_eq!(map.slot_for(1), Some(1));
        assert_eq!(map.slot_for(3), None);
        assert_eq!(map.bind(0, 128), Err(Error::InvalidProgram(128)));
        assert_eq!(map.bind(4, 0), Err(Error::InvalidOutputChannel(5)));
    }

    #[test]
    fn map_from_bytes_validates() {
        assert!(ProgramChangeMap::from_bytes(&[0, 1, 2], 4).is_err());
        assert_eq!(
            ProgramChangeMap::from_bytes(&[0, 200, 2, 3], 4),
            Err(Error::InvalidProgram(200))
        );
        assert!(ProgramChangeMap::from_bytes(&[9, 8, 7, 6], 4).is_ok());
    }

    #[test]
    fn decodes_one_message_per_call() {
        let mut decoder = MidiDecoder::new();
        decoder.feed(&[0xC0, 0x05, 0xC0, 0x06]);
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::ProgramChange(Channel::C1, Program::new(5)))
        );
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::ProgramChange(Channel::C1, Program::new(6)))
        );
        assert_eq!(decoder.next_message(), None);
    }

    #[test]
    fn running_status_and_split_frames() {
        let mut decoder = MidiDecoder::new();
        decoder.feed(&[0x92]);
        assert_eq!(decoder.next_message(), None);
        decoder.feed(&[0x40, 0x7F, 0x41]);
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::NoteOn(Channel::C3, Note::new(0x40), Value7::new(0x7F)))
        );
        assert_eq!(decoder.next_message(), None);
        decoder.feed(&[0x10]);
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::NoteOn(Channel::C3, Note::new(0x41), Value7::new(0x10)))
        );
    }

    #[test]
    fn realtime_bytes_do_not_break_a_frame() {
        let mut decoder = MidiDecoder::new();
        decoder.feed(&[0xC3, 0xF8, 0x09]);
        assert_eq!(decoder.next_message(), Some(MidiMessage::TimingClock));
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::ProgramChange(Channel::C4, Program::new(9)))
        );
    }

    #[test]
    fn sysex_payload_is_skipped() {
        let mut decoder = MidiDecoder::new();
        decoder.feed(&[0xF0, 0x7E, 0x01, 0xF7, 0xC0, 0x02]);
        assert_eq!(
            decoder.next_message(),
            Some(MidiMessage::ProgramChange(Channel::C1, Program::new(2)))
        );
    }

    #[test]
    fn converts_wire_channel() {
        assert_eq!(MidiChannel::from(Channel::C16).get(), 16);
    }
}
