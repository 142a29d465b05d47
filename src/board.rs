//! ESP32-C3 implementations of the device's hardware seams.

use amp_switcher::error::RadioError;
use amp_switcher::indicator::IndicatorDriver;
use amp_switcher::link::{MacAddress, Outbox, Radio};
use amp_switcher::switch::RelayDriver;
use esp_hal::gpio::{Input, Output};
use esp_hal::ledc::LowSpeed;
use esp_hal::ledc::channel::{Channel, ChannelHW};
use esp_radio::esp_now::{EspNowManager, EspNowWifiInterface, PeerInfo};

pub const OUTPUTS: usize = amp_switcher::config::MAX_OUTPUTS;

pub struct Relays {
    pub lines: [Output<'static>; OUTPUTS],
}

impl RelayDriver for Relays {
    fn set_energized(&mut self, line: usize, energized: bool) {
        if let Some(pin) = self.lines.get_mut(line) {
            pin.set_level(energized.into());
        }
    }
}

/// Active-low push buttons with pull-ups.
pub struct Buttons {
    pub inputs: [Input<'static>; OUTPUTS],
}

impl Buttons {
    pub fn levels(&self) -> [bool; OUTPUTS] {
        core::array::from_fn(|i| self.inputs[i].is_low())
    }
}

/// Status LED on a 13-bit LEDC channel.
pub struct StatusLed {
    pub channel: Channel<'static, LowSpeed>,
}

impl IndicatorDriver for StatusLed {
    fn set_duty(&mut self, duty: u16) {
        self.channel.set_duty_hw(u32::from(duty));
    }
}

/// Peer and channel control happen in place; frames are queued for
/// [`send_task`](crate::tasks::radio::send_task).
pub struct EspNowRadio {
    pub manager: EspNowManager<'static>,
    pub outbox: &'static Outbox,
    pub address: MacAddress,
}

impl Radio for EspNowRadio {
    fn own_address(&self) -> MacAddress {
        self.address
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
        self.manager
            .set_channel(channel)
            .map_err(|_| RadioError::Channel)
    }

    fn register_peer(&mut self, peer: MacAddress, channel: u8) -> Result<(), RadioError> {
        let address = peer.octets();
        if self.manager.peer_exists(&address) {
            let _ = self.manager.remove_peer(&address);
        }
        self.manager
            .add_peer(PeerInfo {
                interface: EspNowWifiInterface::Sta,
                peer_address: address,
                lmk: None,
                channel: Some(channel),
                encrypt: false,
            })
            .map_err(|_| RadioError::Peer)
    }

    fn send(&mut self, peer: MacAddress, payload: &[u8]) -> Result<(), RadioError> {
        self.outbox.post(peer, payload)
    }
}
