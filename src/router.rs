//! Program-change routing and MIDI-learn.

use embassy_time::{Duration, Instant};
use midi_types::MidiMessage;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::midi::{MidiChannel, ProgramChangeMap};

/// Where a learn session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LearnState {
    Idle,
    /// Armed by a long hold, waiting for a channel button to pick the slot.
    AwaitingSlot,
    /// Slot chosen, waiting for a program change to bind to it.
    AwaitingProgram { slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MidiLearnSession {
    target_slot: Option<usize>,
    started_at: Instant,
}

/// What the device should do about a program change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Route {
    /// Switch to this output channel (1-based).
    Select(u8),
    /// Single-output builds flip their only relay instead.
    Toggle,
    /// The program was bound to `slot`; the map must be persisted.
    Learned { slot: usize, program: u8 },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IgnoreReason {
    OtherChannel,
    Cooldown,
    Unmapped,
    /// Learn is armed but no slot has been picked yet.
    AwaitingSlot,
}

pub struct MidiRouter {
    map: ProgramChangeMap,
    listen: MidiChannel,
    session: Option<MidiLearnSession>,
    cooldown_until: Option<Instant>,
    learn_timeout: Duration,
    cooldown: Duration,
    single_output: bool,
}

impl MidiRouter {
    pub fn new(config: &Config, map: ProgramChangeMap, listen: MidiChannel) -> Self {
        Self {
            map,
            listen,
            session: None,
            cooldown_until: None,
            learn_timeout: config.learn_timeout,
            cooldown: config.learn_cooldown,
            single_output: config.is_single_output(),
        }
    }

    pub fn map(&self) -> &ProgramChangeMap {
        &self.map
    }

    pub fn listen_channel(&self) -> MidiChannel {
        self.listen
    }

    pub fn set_listen_channel(&mut self, channel: MidiChannel) {
        self.listen = channel;
    }

    pub fn learn_state(&self) -> LearnState {
        match self.session {
            None => LearnState::Idle,
            Some(MidiLearnSession {
                target_slot: Some(slot),
                ..
            }) => LearnState::AwaitingProgram { slot },
            Some(_) => LearnState::AwaitingSlot,
        }
    }

    /// True while a slot is armed and waiting; button dispatch is locked out.
    pub fn is_locked_out(&self) -> bool {
        matches!(self.learn_state(), LearnState::AwaitingProgram { .. })
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn arm_learn(&mut self, now: Instant) {
        info!("[midi] learn armed, press a channel button");
        self.session = Some(MidiLearnSession {
            target_slot: None,
            started_at: now,
        });
    }

    /// Pick the slot the next program change binds to. Restarts the timeout.
    pub fn select_slot(&mut self, slot: usize, now: Instant) -> Result<()> {
        if slot >= self.map.len() {
            return Err(Error::InvalidOutputChannel(slot as u8 + 1));
        }
        let session = self.session.as_mut().ok_or(Error::InvalidButton(slot as u8))?;
        session.target_slot = Some(slot);
        session.started_at = now;
        info!("[midi] learning program for channel {}", slot + 1);
        Ok(())
    }

    pub fn abort_learn(&mut self) {
        if self.session.take().is_some() {
            info!("[midi] learn aborted");
        }
    }

    /// Close a session that has waited too long. Returns `true` when it did.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let expired = self
            .session
            .is_some_and(|s| now.saturating_duration_since(s.started_at) >= self.learn_timeout);
        if expired {
            warn!("[midi] learn timed out");
            self.session = None;
        }
        expired
    }

    /// Route any decoded message. Only program changes are of interest.
    pub fn handle_message(&mut self, message: MidiMessage, now: Instant) -> Option<Route> {
        match message {
            MidiMessage::ProgramChange(channel, program) => {
                let channel = MidiChannel::from(channel);
                self.handle_program_change(channel.get(), u8::from(program), now)
                    .ok()
            }
            _ => None,
        }
    }

    /// Route a program change received on `channel` (1..=16).
    pub fn handle_program_change(&mut self, channel: u8, program: u8, now: Instant) -> Result<Route> {
        let channel = MidiChannel::new(channel)?;
        if program > 127 {
            return Err(Error::InvalidProgram(program));
        }
        if channel != self.listen {
            return Ok(Route::Ignored(IgnoreReason::OtherChannel));
        }
        match self.learn_state() {
            LearnState::AwaitingProgram { slot } => {
                self.map.bind(slot, program)?;
                self.session = None;
                self.cooldown_until = Some(now + self.cooldown);
                info!("[midi] program {} bound to channel {}", program, slot + 1);
                return Ok(Route::Learned { slot, program });
            }
            LearnState::AwaitingSlot => {
                return Ok(Route::Ignored(IgnoreReason::AwaitingSlot));
            }
            LearnState::Idle => {}
        }
        if self.in_cooldown(now) {
            debug!("[midi] program {} ignored during learn cooldown", program);
            return Ok(Route::Ignored(IgnoreReason::Cooldown));
        }
        match self.map.slot_for(program) {
            Some(_) if self.single_output => Ok(Route::Toggle),
            Some(slot) => Ok(Route::Select(slot as u8 + 1)),
            None => {
                info!("[midi] program {} is not mapped", program);
                Ok(Route::Ignored(IgnoreReason::Unmapped))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use midi_types::{Channel, Program};

    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn router() -> MidiRouter {
        let config = Config::default();
        MidiRouter::new(&config, ProgramChangeMap::identity(4), MidiChannel::default())
    }

    #[test]
    fn identity_map_selects_program_plus_one() {
        let mut router = router();
        assert_eq!(router.handle_program_change(1, 2, at(0)), Ok(Route::Select(3)));
        assert_eq!(
            router.handle_program_change(1, 9, at(0)),
            Ok(Route::Ignored(IgnoreReason::Unmapped))
        );
    }

    #[test]
    fn other_channels_are_ignored() {
        let mut router = router();
        assert_eq!(
            router.handle_program_change(2, 0, at(0)),
            Ok(Route::Ignored(IgnoreReason::OtherChannel))
        );
    }

    #[test]
    fn invalid_parameters_are_rejected_without_side_effects() {
        let mut router = router();
        router.arm_learn(at(0));
        router.select_slot(1, at(0)).unwrap();
        assert_eq!(
            router.handle_program_change(0, 5, at(10)),
            Err(Error::InvalidMidiChannel(0))
        );
        assert_eq!(
            router.handle_program_change(17, 5, at(10)),
            Err(Error::InvalidMidiChannel(17))
        );
        assert_eq!(
            router.handle_program_change(1, 128, at(10)),
            Err(Error::InvalidProgram(128))
        );
        assert_eq!(router.learn_state(), LearnState::AwaitingProgram { slot: 1 });
        assert_eq!(router.map(), &ProgramChangeMap::identity(4));
    }

    #[test]
    fn learn_binds_then_cools_down() {
        let mut router = router();
        router.arm_learn(at(0));
        assert!(!router.is_locked_out());
        router.select_slot(2, at(100)).unwrap();
        assert!(router.is_locked_out());

        assert_eq!(
            router.handle_program_change(1, 77, at(500)),
            Ok(Route::Learned { slot: 2, program: 77 })
        );
        assert_eq!(router.learn_state(), LearnState::Idle);
        assert!(!router.is_locked_out());

        assert_eq!(
            router.handle_program_change(1, 77, at(2499)),
            Ok(Route::Ignored(IgnoreReason::Cooldown))
        );
        assert_eq!(router.handle_program_change(1, 77, at(2500)), Ok(Route::Select(3)));
    }

    #[test]
    fn program_changes_wait_for_a_slot() {
        let mut router = router();
        router.arm_learn(at(0));
        assert_eq!(
            router.handle_program_change(1, 1, at(10)),
            Ok(Route::Ignored(IgnoreReason::AwaitingSlot))
        );
    }

    #[test]
    fn learn_times_out() {
        let mut router = router();
        router.arm_learn(at(0));
        router.select_slot(0, at(1_000)).unwrap();
        assert!(!router.check_timeout(at(10_999)));
        assert!(router.check_timeout(at(11_000)));
        assert_eq!(router.learn_state(), LearnState::Idle);
        assert!(!router.check_timeout(at(12_000)));
    }

    #[test]
    fn single_output_toggles() {
        let config = Config::single_output();
        let mut router = MidiRouter::new(&config, ProgramChangeMap::identity(1), MidiChannel::default());
        assert_eq!(router.handle_program_change(1, 0, at(0)), Ok(Route::Toggle));
        assert_eq!(
            router.handle_program_change(1, 1, at(0)),
            Ok(Route::Ignored(IgnoreReason::Unmapped))
        );
    }

    #[test]
    fn decoded_messages_are_routed() {
        let mut router = router();
        let message = MidiMessage::ProgramChange(Channel::C1, Program::new(3));
        assert_eq!(router.handle_message(message, at(0)), Some(Route::Select(4)));
        assert_eq!(router.handle_message(MidiMessage::TimingClock, at(0)), None);
    }
}
