//! Controller discovery.
//!
//! While unpaired the engine walks the radio channels, broadcasting a pairing
//! request on each and waiting one reply timeout before moving on. The first
//! reply from a controller ends the scan.

use embassy_time::{Duration, Instant};

use crate::config::{Config, RADIO_CHANNELS};
use crate::error::RadioError;
use crate::link::{MacAddress, PairingPacket, Radio};
use crate::store::{KeyValueStore, PairingRecord, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Unpaired,
    Requesting { channel: u8 },
    AwaitingReply { channel: u8, sent_at: Instant },
    Paired { peer: MacAddress, channel: u8 },
}

impl LinkState {
    pub fn is_scanning(&self) -> bool {
        matches!(
            self,
            LinkState::Requesting { .. } | LinkState::AwaitingReply { .. }
        )
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, LinkState::Paired { .. })
    }
}

/// Next scan channel, wrapping back to 1 after the last one.
pub const fn next_channel(channel: u8) -> u8 {
    if channel >= RADIO_CHANNELS { 1 } else { channel + 1 }
}

pub struct PairingEngine {
    state: LinkState,
    /// Last record written to the store, used to skip redundant writes.
    known: Option<PairingRecord>,
    reply_timeout: Duration,
    board_id: u8,
    device_name: &'static str,
}

impl PairingEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            state: LinkState::Unpaired,
            known: None,
            reply_timeout: config.pairing_reply_timeout,
            board_id: config.board_id,
            device_name: config.device_name,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn record(&self) -> Option<PairingRecord> {
        self.known
    }

    /// Restore a stored controller, or stay unpaired so the next tick scans.
    pub fn boot<S: KeyValueStore, R: Radio>(&mut self, settings: &mut Settings<S>, radio: &mut R) {
        self.state = LinkState::Unpaired;
        let Some(record) = settings.load_pairing() else {
            info!("[pairing] no stored controller, scanning");
            return;
        };
        self.known = Some(record);
        match connect(radio, record.peer, record.channel) {
            Ok(()) => {
                info!("[pairing] restored controller {} on channel {}", record.peer, record.channel);
                self.state = LinkState::Paired {
                    peer: record.peer,
                    channel: record.channel,
                };
            }
            Err(err) => {
                error!("[pairing] could not restore stored controller: {:?}", err);
            }
        }
    }

    pub fn tick<R: Radio>(&mut self, now: Instant, radio: &mut R) {
        match self.state {
            LinkState::Unpaired => self.request(1, now, radio),
            LinkState::Requesting { channel } => self.request(channel, now, radio),
            LinkState::AwaitingReply { channel, sent_at } => {
                if now.saturating_duration_since(sent_at) > self.reply_timeout {
                    let next = next_channel(channel);
                    debug!("[pairing] no reply on channel {}, trying {}", channel, next);
                    self.state = LinkState::Requesting { channel: next };
                }
            }
            LinkState::Paired { .. } => {}
        }
    }

    fn request<R: Radio>(&mut self, channel: u8, now: Instant, radio: &mut R) {
        info!("[pairing] request on channel {}", channel);
        let packet = PairingPacket::new(self.board_id, radio.own_address(), channel, self.device_name);
        let sent = connect(radio, MacAddress::BROADCAST, channel)
            .and_then(|()| radio.send(MacAddress::BROADCAST, &packet.encode()));
        if let Err(err) = sent {
            // The reply timeout moves the scan along anyway.
            warn!("[pairing] request on channel {} failed: {:?}", channel, err);
        }
        self.state = LinkState::AwaitingReply {
            channel,
            sent_at: now,
        };
    }

    /// Handle a pairing packet. Returns `true` when it completed pairing.
    pub fn on_reply<S: KeyValueStore, R: Radio>(
        &mut self,
        packet: &PairingPacket,
        settings: &mut Settings<S>,
        radio: &mut R,
    ) -> bool {
        if !packet.is_from_controller() {
            debug!("[pairing] ignoring pairing packet from peer {}", packet.id);
            return false;
        }
        let (LinkState::Requesting { channel } | LinkState::AwaitingReply { channel, .. }) =
            self.state
        else {
            debug!("[pairing] ignoring reply, not scanning");
            return false;
        };
        let channel = if (1..=RADIO_CHANNELS).contains(&packet.channel) {
            packet.channel
        } else {
            channel
        };
        if let Err(err) = connect(radio, packet.mac, channel) {
            error!("[pairing] failed to add controller {}: {:?}", packet.mac, err);
            return false;
        }

        let record = PairingRecord::new(packet.mac, channel);
        if self.known == Some(record) {
            debug!("[pairing] controller unchanged, not saving");
        } else if let Err(err) = settings.save_pairing(&record) {
            error!("[pairing] failed to persist controller: {:?}", err);
        }
        self.known = Some(record);
        self.state = LinkState::Paired {
            peer: record.peer,
            channel,
        };
        info!("[pairing] paired with {} on channel {}", record.peer, channel);
        true
    }

    /// Forget the controller and start a fresh scan.
    pub fn reset<S: KeyValueStore>(&mut self, settings: &mut Settings<S>) {
        if let Err(err) = settings.clear_pairing() {
            error!("[pairing] failed to clear stored controller: {:?}", err);
        }
        self.known = None;
        self.state = LinkState::Unpaired;
        warn!("[pairing] pairing reset");
    }
}

fn connect<R: Radio>(radio: &mut R, peer: MacAddress, channel: u8) -> Result<(), RadioError> {
    radio.set_channel(channel)?;
    radio.register_peer(peer, channel)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::MemoryStore;

    const OWN: MacAddress = MacAddress([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
    const CONTROLLER: MacAddress = MacAddress([0xA0, 0xB1, 0xC2, 0xD3, 0xE4, 0xF5]);

    #[derive(Default)]
    struct FakeRadio {
        channel: u8,
        peers: std::vec::Vec<(MacAddress, u8)>,
        sent: std::vec::Vec<(u8, std::vec::Vec<u8>)>,
        fail_sends: bool,
    }

    impl Radio for FakeRadio {
        fn own_address(&self) -> MacAddress {
            OWN
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
            self.channel = channel;
            Ok(())
        }

        fn register_peer(&mut self, peer: MacAddress, channel: u8) -> Result<(), RadioError> {
            self.peers.push((peer, channel));
            Ok(())
        }

        fn send(&mut self, _peer: MacAddress, payload: &[u8]) -> Result<(), RadioError> {
            if self.fail_sends {
                return Err(RadioError::Send);
            }
            self.sent.push((self.channel, payload.to_vec()));
            Ok(())
        }
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn reply(channel: u8) -> PairingPacket {
        PairingPacket::new(PairingPacket::CONTROLLER_ID, CONTROLLER, channel, "SERVER")
    }

    #[test]
    fn scan_broadcasts_and_advances_on_timeout() {
        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio::default();

        engine.tick(at(0), &mut radio);
        assert!(matches!(engine.state(), LinkState::AwaitingReply { channel: 1, .. }));
        let (channel, payload) = &radio.sent[0];
        assert_eq!(*channel, 1);
        let request = PairingPacket::decode(payload).unwrap();
        assert_eq!(request.mac, OWN);
        assert_eq!(request.id, 1);
        assert_eq!(radio.peers[0], (MacAddress::BROADCAST, 1));

        engine.tick(at(1_000), &mut radio);
        assert!(matches!(engine.state(), LinkState::AwaitingReply { channel: 1, .. }));
        engine.tick(at(1_001), &mut radio);
        assert_eq!(engine.state(), LinkState::Requesting { channel: 2 });
    }

    #[test]
    fn last_channel_wraps_to_first() {
        assert_eq!(next_channel(12), 13);
        assert_eq!(next_channel(13), 1);
    }

    #[test]
    fn send_failure_keeps_scanning() {
        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio {
            fail_sends: true,
            ..Default::default()
        };
        engine.tick(at(0), &mut radio);
        assert!(engine.state().is_scanning());
        engine.tick(at(1_500), &mut radio);
        assert_eq!(engine.state(), LinkState::Requesting { channel: 2 });
    }

    #[test]
    fn controller_reply_pairs_and_persists_once() {
        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio::default();
        let mut settings = Settings::new(MemoryStore::new());

        engine.tick(at(0), &mut radio);
        assert!(engine.on_reply(&reply(1), &mut settings, &mut radio));
        assert_eq!(
            engine.state(),
            LinkState::Paired {
                peer: CONTROLLER,
                channel: 1
            }
        );
        assert_eq!(radio.peers.last(), Some(&(CONTROLLER, 1)));
        assert_eq!(settings.load_pairing(), Some(PairingRecord::new(CONTROLLER, 1)));
        let writes = settings.store().writes();

        // Same controller again after a reset of the link only.
        engine.state = LinkState::Requesting { channel: 1 };
        assert!(engine.on_reply(&reply(1), &mut settings, &mut radio));
        assert_eq!(settings.store().writes(), writes);
    }

    #[test]
    fn echo_of_own_broadcast_is_ignored() {
        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio::default();
        let mut settings = Settings::new(MemoryStore::new());
        engine.tick(at(0), &mut radio);
        let echo = PairingPacket::new(1, OWN, 1, "ESP32_CLIENT");
        assert!(!engine.on_reply(&echo, &mut settings, &mut radio));
        assert!(engine.state().is_scanning());
    }

    #[test]
    fn boot_restores_stored_controller_without_scanning() {
        let mut settings = Settings::new(MemoryStore::new());
        settings.save_pairing(&PairingRecord::new(CONTROLLER, 6)).unwrap();
        let writes = settings.store().writes();

        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio::default();
        engine.boot(&mut settings, &mut radio);
        assert_eq!(
            engine.state(),
            LinkState::Paired {
                peer: CONTROLLER,
                channel: 6
            }
        );
        assert_eq!(radio.channel, 6);
        engine.tick(at(5_000), &mut radio);
        assert!(radio.sent.is_empty());
        assert_eq!(settings.store().writes(), writes);
    }

    #[test]
    fn reset_clears_store_and_rescans() {
        let mut settings = Settings::new(MemoryStore::new());
        settings.save_pairing(&PairingRecord::new(CONTROLLER, 6)).unwrap();
        let mut engine = PairingEngine::new(&Config::default());
        let mut radio = FakeRadio::default();
        engine.boot(&mut settings, &mut radio);

        engine.reset(&mut settings);
        assert_eq!(engine.state(), LinkState::Unpaired);
        assert_eq!(settings.load_pairing(), None);
        engine.tick(at(0), &mut radio);
        assert!(matches!(engine.state(), LinkState::AwaitingReply { channel: 1, .. }));
    }

    proptest! {
        #[test]
        fn scan_reaches_any_reply_channel(reply_channel in 1u8..=RADIO_CHANNELS) {
            let mut engine = PairingEngine::new(&Config::default());
            let mut radio = FakeRadio::default();
            let mut settings = Settings::new(MemoryStore::new());
            let mut timeouts = 0;
            let mut now = 0;
            while !engine.state().is_paired() {
                let before = engine.state();
                engine.tick(at(now), &mut radio);
                if matches!(before, LinkState::AwaitingReply { .. })
                    && matches!(engine.state(), LinkState::Requesting { .. })
                {
                    timeouts += 1;
                }
                if radio.channel == reply_channel && !radio.sent.is_empty() {
                    engine.on_reply(&reply(reply_channel), &mut settings, &mut radio);
                }
                prop_assert!(timeouts <= RADIO_CHANNELS);
                now += 100;
            }
            prop_assert_eq!(
                engine.state(),
                LinkState::Paired { peer: CONTROLLER, channel: reply_channel }
            );
        }
    }
}
