//! Wireless link plumbing: peer addresses, the packet layouts shared with the
//! controller, the radio contract, and the queues between the radio tasks and
//! the tick loop.
//!
//! Radio callbacks run outside the tick loop. They only copy what arrived into
//! the [`Inbox`]; the device drains it once per tick. Frames going out wait in
//! an [`Outbox`] for the send task, whose delivery status comes back through
//! the inbox.

use core::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::error::{Error, RadioError, Result};

/// Largest ESP-NOW payload.
pub const MAX_PAYLOAD: usize = 250;
pub const INBOX_DEPTH: usize = 8;
pub const OUTBOX_DEPTH: usize = 4;
pub const PEER_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for MacAddress {
    fn format(&self, f: defmt::Formatter) {
        let [a, b, c, d, e, g] = self.0;
        defmt::write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a,
            b,
            c,
            d,
            e,
            g
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    Pairing = 0,
    Data = 1,
    Command = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Pairing),
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Command),
            _ => Err(Error::MalformedPacket),
        }
    }
}

/// Pairing request/reply. Layout: type, id, mac[6], channel, name[32].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPacket {
    /// 0 when sent by the controller.
    pub id: u8,
    pub mac: MacAddress,
    pub channel: u8,
    pub name: [u8; PEER_NAME_LEN],
}

impl PairingPacket {
    pub const LEN: usize = 9 + PEER_NAME_LEN;
    pub const CONTROLLER_ID: u8 = 0;

    pub fn new(id: u8, mac: MacAddress, channel: u8, name: &str) -> Self {
        let mut buf = [0; PEER_NAME_LEN];
        // Keep a trailing NUL like the controller expects.
        let len = name.len().min(PEER_NAME_LEN - 1);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            id,
            mac,
            channel,
            name: buf,
        }
    }

    pub fn is_from_controller(&self) -> bool {
        self.id == Self::CONTROLLER_ID
    }

    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PEER_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0; Self::LEN];
        out[0] = MessageType::Pairing as u8;
        out[1] = self.id;
        out[2..8].copy_from_slice(&self.mac.0);
        out[8] = self.channel;
        out[9..].copy_from_slice(&self.name);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN || bytes[0] != MessageType::Pairing as u8 {
            return Err(Error::MalformedPacket);
        }
        let mut mac = [0; 6];
        mac.copy_from_slice(&bytes[2..8]);
        let mut name = [0; PEER_NAME_LEN];
        name.copy_from_slice(&bytes[9..Self::LEN]);
        Ok(Self {
            id: bytes[1],
            mac: MacAddress(mac),
            channel: bytes[8],
            name,
        })
    }
}

/// Sensor data or a command from the controller, sharing one 20-byte layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPacket {
    pub id: u8,
    pub temperature: f32,
    pub humidity: f32,
    pub reading_id: u32,
    pub command: u8,
    pub command_value: u8,
}

impl DataPacket {
    pub const LEN: usize = 20;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(Error::MalformedPacket);
        }
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        Ok(Self {
            id: bytes[1],
            temperature: f32::from_le_bytes(word(4)),
            humidity: f32::from_le_bytes(word(8)),
            reading_id: u32::from_le_bytes(word(12)),
            command: bytes[16],
            command_value: bytes[17],
        })
    }

    pub fn encode(&self, kind: MessageType) -> [u8; Self::LEN] {
        let mut out = [0; Self::LEN];
        out[0] = kind as u8;
        out[1] = self.id;
        out[4..8].copy_from_slice(&self.temperature.to_le_bytes());
        out[8..12].copy_from_slice(&self.humidity.to_le_bytes());
        out[12..16].copy_from_slice(&self.reading_id.to_le_bytes());
        out[16] = self.command;
        out[17] = self.command_value;
        out
    }
}

/// Command carried in a [`MessageType::Command`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RemoteCommand {
    /// Select an output channel directly (0 turns everything off).
    ProgramChange(u8),
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Pairing(PairingPacket),
    Data(DataPacket),
    Command(RemoteCommand),
}

impl Packet {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let kind = MessageType::try_from(*bytes.first().ok_or(Error::MalformedPacket)?)?;
        Ok(match kind {
            MessageType::Pairing => Packet::Pairing(PairingPacket::decode(bytes)?),
            MessageType::Data => Packet::Data(DataPacket::decode(bytes)?),
            MessageType::Command => {
                let data = DataPacket::decode(bytes)?;
                Packet::Command(match data.command {
                    0 => RemoteCommand::ProgramChange(data.command_value),
                    other => RemoteCommand::Unknown(other),
                })
            }
        })
    }
}

/// Peer-to-peer radio used by the pairing engine.
pub trait Radio {
    fn own_address(&self) -> MacAddress;
    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError>;
    /// Register (or re-register) a peer reachable on `channel`.
    fn register_peer(&mut self, peer: MacAddress, channel: u8) -> Result<(), RadioError>;
    fn send(&mut self, peer: MacAddress, payload: &[u8]) -> Result<(), RadioError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Received {
        from: MacAddress,
        payload: Vec<u8, MAX_PAYLOAD>,
    },
    SendComplete {
        to: MacAddress,
        delivered: bool,
    },
}

/// Single-consumer queue between radio callbacks and the tick loop.
pub struct Inbox {
    events: Channel<CriticalSectionRawMutex, LinkEvent, INBOX_DEPTH>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
        }
    }

    /// Stage a received frame. Returns `false` when it had to be dropped.
    pub fn post_received(&self, from: MacAddress, data: &[u8]) -> bool {
        let Ok(payload) = Vec::from_slice(data) else {
            return false;
        };
        self.events
            .try_send(LinkEvent::Received { from, payload })
            .is_ok()
    }

    pub fn post_send_complete(&self, to: MacAddress, delivered: bool) -> bool {
        self.events
            .try_send(LinkEvent::SendComplete { to, delivered })
            .is_ok()
    }

    pub fn next(&self) -> Option<LinkEvent> {
        self.events.try_receive().ok()
    }
}

/// A frame waiting for the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: MacAddress,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

/// Frames handed from the tick loop to the send task.
pub struct Outbox {
    frames: Channel<CriticalSectionRawMutex, Outgoing, OUTBOX_DEPTH>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub const fn new() -> Self {
        Self {
            frames: Channel::new(),
        }
    }

    pub fn post(&self, to: MacAddress, data: &[u8]) -> Result<(), RadioError> {
        let payload = Vec::from_slice(data).map_err(|_| RadioError::Send)?;
        self.frames
            .try_send(Outgoing { to, payload })
            .map_err(|_| RadioError::Send)
    }

    /// Wait for the next frame to transmit.
    pub async fn next(&self) -> Outgoing {
        self.frames.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLLER: MacAddress = MacAddress([0x24, 0x6F, 0x28, 0x01, 0x02, 0x03]);

    #[test]
    fn pairing_packet_layout_matches_controller() {
        let packet = PairingPacket::new(1, CONTROLLER, 6, "CLIENT_1");
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 41);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..8], &CONTROLLER.0);
        assert_eq!(bytes[8], 6);
        assert_eq!(&bytes[9..17], b"CLIENT_1");
        assert_eq!(bytes[17], 0);

        let decoded = PairingPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.name(), "CLIENT_1");
        assert!(!decoded.is_from_controller());
    }

    #[test]
    fn long_names_keep_a_terminator() {
        let packet = PairingPacket::new(1, CONTROLLER, 1, &"x".repeat(40));
        assert_eq!(packet.name().len(), PEER_NAME_LEN - 1);
    }

    #[test]
    fn short_frames_are_malformed() {
        assert_eq!(Packet::decode(&[]), Err(Error::MalformedPacket));
        assert_eq!(Packet::decode(&[0, 0, 1]), Err(Error::MalformedPacket));
        assert_eq!(Packet::decode(&[9; 41]), Err(Error::MalformedPacket));
    }

    #[test]
    fn command_packets_carry_program_change() {
        let data = DataPacket {
            id: 0,
            temperature: 0.0,
            humidity: 0.0,
            reading_id: 7,
            command: 0,
            command_value: 3,
        };
        let packet = Packet::decode(&data.encode(MessageType::Command)).unwrap();
        assert_eq!(packet, Packet::Command(RemoteCommand::ProgramChange(3)));
    }

    #[test]
    fn mac_address_display() {
        assert_eq!(CONTROLLER.to_string(), "24:6F:28:01:02:03");
    }

    #[test]
    fn inbox_drops_oversized_frames_and_preserves_order() {
        let inbox = Inbox::new();
        assert!(!inbox.post_received(CONTROLLER, &[0; MAX_PAYLOAD + 1]));
        assert!(inbox.post_received(CONTROLLER, &[1]));
        assert!(inbox.post_send_complete(CONTROLLER, false));
        assert!(matches!(inbox.next(), Some(LinkEvent::Received { .. })));
        assert_eq!(
            inbox.next(),
            Some(LinkEvent::SendComplete {
                to: CONTROLLER,
                delivered: false
            })
        );
        assert_eq!(inbox.next(), None);
    }

    #[test]
    fn outbox_queues_frames_until_the_send_task_takes_them() {
        let outbox = Outbox::new();
        assert_eq!(
            outbox.post(CONTROLLER, &[0; MAX_PAYLOAD + 1]),
            Err(RadioError::Send)
        );
        for n in 0..OUTBOX_DEPTH as u8 {
            assert_eq!(outbox.post(MacAddress::BROADCAST, &[n]), Ok(()));
        }
        assert_eq!(outbox.post(CONTROLLER, &[9]), Err(RadioError::Send));

        let first = embassy_futures::block_on(outbox.next());
        assert_eq!(first.to, MacAddress::BROADCAST);
        assert_eq!(first.payload.as_slice(), &[0]);
        assert_eq!(outbox.post(CONTROLLER, &[9]), Ok(()));
    }
}
