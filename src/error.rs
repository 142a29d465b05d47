use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("output channel {0} is out of range")]
    InvalidOutputChannel(u8),
    #[error("MIDI channel {0} is outside 1..=16")]
    InvalidMidiChannel(u8),
    #[error("program {0} is outside 0..=127")]
    InvalidProgram(u8),
    #[error("button {0} does not exist")]
    InvalidButton(u8),
    #[error("radio channel {0} is outside 1..=13")]
    InvalidRadioChannel(u8),
    #[error("log level {0} is outside 0..=4")]
    InvalidLogLevel(u8),
    #[error("malformed packet")]
    MalformedPacket,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("radio: {0}")]
    Radio(#[from] RadioError),
}

/// Failures reported by a [`KeyValueStore`](crate::store::KeyValueStore) backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    #[error("no space left")]
    Full,
    #[error("value does not fit")]
    ValueTooLarge,
    #[error("backend failure")]
    Backend,
}

/// Failures reported by a [`Radio`](crate::link::Radio) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioError {
    #[error("channel change rejected")]
    Channel,
    #[error("peer registration rejected")]
    Peer,
    #[error("send failed")]
    Send,
}
