//! Versioned access to the persistent key-value store.
//!
//! Every namespace carries a `version` key. A namespace whose version is
//! missing or different from [`STORAGE_VERSION`] is never trusted: it is
//! cleared, stamped with the current version and reported as empty.

use heapless::{LinearMap, String, Vec};

use crate::config::{RADIO_CHANNELS, STORAGE_VERSION};
use crate::error::StoreError;
use crate::fmt::LogLevel;
use crate::link::MacAddress;
use crate::midi::{MidiChannel, ProgramChangeMap};

const VERSION_KEY: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Namespace {
    Pairing,
    MidiChannel,
    MidiMap,
    Logging,
}

impl Namespace {
    pub const fn name(self) -> &'static str {
        match self {
            Namespace::Pairing => "pairing",
            Namespace::MidiChannel => "midi_channel",
            Namespace::MidiMap => "midi_map",
            Namespace::Logging => "logging",
        }
    }

    /// Every key kept in this namespace, the version stamp included.
    pub const fn keys(self) -> &'static [&'static str] {
        match self {
            Namespace::Pairing => &[VERSION_KEY, "server_mac", "channel"],
            Namespace::MidiChannel => &[VERSION_KEY, "channel"],
            Namespace::MidiMap => &[VERSION_KEY, "map"],
            Namespace::Logging => &[VERSION_KEY, "log_level"],
        }
    }
}

/// Non-volatile storage backend.
pub trait KeyValueStore {
    /// Copy the value stored under `key` into `buf`, returning its length.
    fn get(&mut self, namespace: Namespace, key: &str, buf: &mut [u8])
    -> Result<Option<usize>, StoreError>;
    fn put(&mut self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn clear(&mut self, namespace: Namespace) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &mut T {
    fn get(
        &mut self,
        namespace: Namespace,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        T::get(self, namespace, key, buf)
    }

    fn put(&mut self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        T::put(self, namespace, key, value)
    }

    fn clear(&mut self, namespace: Namespace) -> Result<(), StoreError> {
        T::clear(self, namespace)
    }
}

const MEMORY_KEY_LEN: usize = 16;
const MEMORY_VALUE_LEN: usize = 16;
const MEMORY_ENTRIES: usize = 16;

type MemoryKey = (Namespace, String<MEMORY_KEY_LEN>);

/// RAM-backed store for host builds and tests.
#[derive(Default, Clone)]
pub struct MemoryStore {
    entries: LinearMap<MemoryKey, Vec<u8, MEMORY_VALUE_LEN>, MEMORY_ENTRIES>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls, excluding version stamps.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        Self::key(namespace, key).is_some_and(|k| self.entries.contains_key(&k))
    }

    fn key(namespace: Namespace, key: &str) -> Option<MemoryKey> {
        String::try_from(key).ok().map(|key| (namespace, key))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(
        &mut self,
        namespace: Namespace,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        let Some(value) = Self::key(namespace, key).and_then(|k| self.entries.get(&k)) else {
            return Ok(None);
        };
        let target = buf.get_mut(..value.len()).ok_or(StoreError::ValueTooLarge)?;
        target.copy_from_slice(value);
        Ok(Some(value.len()))
    }

    fn put(&mut self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key_owned = Self::key(namespace, key).ok_or(StoreError::ValueTooLarge)?;
        let value = Vec::from_slice(value).map_err(|_| StoreError::ValueTooLarge)?;
        self.entries
            .insert(key_owned, value)
            .map_err(|_| StoreError::Full)?;
        if key != VERSION_KEY {
            self.writes += 1;
        }
        Ok(())
    }

    fn clear(&mut self, namespace: Namespace) -> Result<(), StoreError> {
        let doomed: Vec<MemoryKey, MEMORY_ENTRIES> = self
            .entries
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .cloned()
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        Ok(())
    }
}

/// The persisted controller peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PairingRecord {
    pub peer: MacAddress,
    pub channel: u8,
    pub schema_version: u32,
}

impl PairingRecord {
    pub fn new(peer: MacAddress, channel: u8) -> Self {
        Self {
            peer,
            channel,
            schema_version: STORAGE_VERSION,
        }
    }
}

/// Typed, version-checked view over a [`KeyValueStore`].
pub struct Settings<S> {
    store: S,
}

impl<S: KeyValueStore> Settings<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn version_matches(&mut self, namespace: Namespace) -> Result<bool, StoreError> {
        let mut buf = [0; 4];
        Ok(match self.store.get(namespace, VERSION_KEY, &mut buf)? {
            Some(4) => u32::from_le_bytes(buf) == STORAGE_VERSION,
            _ => false,
        })
    }

    /// Wipe a namespace and stamp it with the current schema version.
    pub fn reset(&mut self, namespace: Namespace) -> Result<(), StoreError> {
        self.store.clear(namespace)?;
        self.store
            .put(namespace, VERSION_KEY, &STORAGE_VERSION.to_le_bytes())
    }

    fn read(
        &mut self,
        namespace: Namespace,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        if !self.version_matches(namespace)? {
            warn!(
                "[store] {} has a stale schema version, resetting",
                namespace.name()
            );
            self.reset(namespace)?;
            return Ok(None);
        }
        self.store.get(namespace, key, buf)
    }

    fn write(&mut self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.store.put(namespace, key, value)?;
        self.store
            .put(namespace, VERSION_KEY, &STORAGE_VERSION.to_le_bytes())
    }

    fn heal(&mut self, namespace: Namespace) {
        warn!("[store] {} holds a malformed record, resetting", namespace.name());
        if let Err(err) = self.reset(namespace) {
            error!("[store] reset of {} failed: {:?}", namespace.name(), err);
        }
    }

    fn read_byte(&mut self, namespace: Namespace, key: &str) -> Option<u8> {
        let mut buf = [0; 1];
        match self.read(namespace, key, &mut buf) {
            Ok(Some(1)) => Some(buf[0]),
            Ok(Some(_)) => {
                self.heal(namespace);
                None
            }
            Ok(None) => None,
            Err(err) => {
                error!("[store] read of {} failed: {:?}", namespace.name(), err);
                None
            }
        }
    }

    /// Load the controller record, if a valid one exists.
    pub fn load_pairing(&mut self) -> Option<PairingRecord> {
        let mut mac = [0; 6];
        let peer = match self.read(Namespace::Pairing, "server_mac", &mut mac) {
            Ok(Some(6)) => MacAddress(mac),
            Ok(Some(_)) => {
                self.heal(Namespace::Pairing);
                return None;
            }
            Ok(None) => {
                debug!("[store] no controller stored");
                return None;
            }
            Err(err) => {
                error!("[store] pairing read failed: {:?}", err);
                return None;
            }
        };
        match self.read_byte(Namespace::Pairing, "channel") {
            Some(channel @ 1..=RADIO_CHANNELS) => {
                info!("[store] loaded controller {} on channel {}", peer, channel);
                Some(PairingRecord::new(peer, channel))
            }
            _ => {
                self.heal(Namespace::Pairing);
                None
            }
        }
    }

    pub fn save_pairing(&mut self, record: &PairingRecord) -> Result<(), StoreError> {
        self.write(Namespace::Pairing, "server_mac", &record.peer.0)?;
        self.write(Namespace::Pairing, "channel", &[record.channel])?;
        info!(
            "[store] saved controller {} on channel {}",
            record.peer, record.channel
        );
        Ok(())
    }

    pub fn clear_pairing(&mut self) -> Result<(), StoreError> {
        self.reset(Namespace::Pairing)?;
        info!("[store] pairing cleared");
        Ok(())
    }

    /// Load the listening MIDI channel. Anything but a valid stored channel
    /// falls back to channel 1, which is written back.
    pub fn load_midi_channel(&mut self) -> MidiChannel {
        let raw = self.read_byte(Namespace::MidiChannel, "channel");
        if let Some(channel) = raw.and_then(|raw| MidiChannel::new(raw).ok()) {
            return channel;
        }
        if raw.is_some() {
            self.heal(Namespace::MidiChannel);
        }
        let channel = MidiChannel::default();
        warn!("[store] MIDI channel reset to {}", channel.get());
        if let Err(err) = self.save_midi_channel(channel) {
            error!("[store] MIDI channel write failed: {:?}", err);
        }
        channel
    }

    pub fn save_midi_channel(&mut self, channel: MidiChannel) -> Result<(), StoreError> {
        self.write(Namespace::MidiChannel, "channel", &[channel.get()])?;
        info!("[store] MIDI channel {} saved", channel.get());
        Ok(())
    }

    /// Load the program-change map for `outputs` slots. A missing or
    /// malformed map is replaced by the identity map, which is written back.
    pub fn load_program_map(&mut self, outputs: usize) -> ProgramChangeMap {
        let mut buf = [0; crate::config::MAX_OUTPUTS];
        let loaded = match self.read(Namespace::MidiMap, "map", &mut buf) {
            Ok(Some(len)) => {
                let map = ProgramChangeMap::from_bytes(&buf[..len], outputs);
                if map.is_err() {
                    self.heal(Namespace::MidiMap);
                }
                map.ok()
            }
            Ok(None) => None,
            Err(StoreError::ValueTooLarge) => {
                self.heal(Namespace::MidiMap);
                None
            }
            Err(err) => {
                error!("[store] MIDI map read failed: {:?}", err);
                None
            }
        };
        if let Some(map) = loaded {
            info!("[store] MIDI map loaded");
            return map;
        }
        let map = ProgramChangeMap::identity(outputs);
        warn!("[store] MIDI map reset to defaults");
        if let Err(err) = self.save_program_map(&map) {
            error!("[store] MIDI map write failed: {:?}", err);
        }
        map
    }

    pub fn save_program_map(&mut self, map: &ProgramChangeMap) -> Result<(), StoreError> {
        self.write(Namespace::MidiMap, "map", map.as_bytes())?;
        info!("[store] MIDI map saved");
        Ok(())
    }

    /// Load the log level. A missing level reads as Info; an out-of-range
    /// one is healed and replaced by Info.
    pub fn load_log_level(&mut self) -> LogLevel {
        let Some(raw) = self.read_byte(Namespace::Logging, "log_level") else {
            return LogLevel::default();
        };
        LogLevel::try_from(raw).unwrap_or_else(|_| {
            self.heal(Namespace::Logging);
            let level = LogLevel::default();
            if let Err(err) = self.save_log_level(level) {
                error!("[store] log level write failed: {:?}", err);
            }
            level
        })
    }

    pub fn save_log_level(&mut self, level: LogLevel) -> Result<(), StoreError> {
        self.write(Namespace::Logging, "log_level", &[level as u8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLLER: MacAddress = MacAddress([0xA0, 0xB1, 0xC2, 0xD3, 0xE4, 0xF5]);

    fn stamp(store: &mut MemoryStore, namespace: Namespace, version: u32) {
        store
            .put(namespace, VERSION_KEY, &version.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn pairing_record_survives_a_save_load_cycle() {
        let mut settings = Settings::new(MemoryStore::new());
        settings.save_pairing(&PairingRecord::new(CONTROLLER, 6)).unwrap();
        assert_eq!(
            settings.load_pairing(),
            Some(PairingRecord::new(CONTROLLER, 6))
        );
    }

    #[test]
    fn stale_pairing_version_is_never_used_and_gets_rewritten() {
        let mut store = MemoryStore::new();
        store.put(Namespace::Pairing, "server_mac", &CONTROLLER.0).unwrap();
        store.put(Namespace::Pairing, "channel", &[3]).unwrap();
        stamp(&mut store, Namespace::Pairing, STORAGE_VERSION + 1);

        let mut settings = Settings::new(store);
        assert_eq!(settings.load_pairing(), None);
        assert!(!settings.store().contains(Namespace::Pairing, "server_mac"));
        assert!(settings.version_matches(Namespace::Pairing).unwrap());
    }

    #[test]
    fn short_mac_is_treated_as_absent() {
        let mut store = MemoryStore::new();
        store.put(Namespace::Pairing, "server_mac", &[1, 2, 3]).unwrap();
        store.put(Namespace::Pairing, "channel", &[3]).unwrap();
        stamp(&mut store, Namespace::Pairing, STORAGE_VERSION);

        let mut settings = Settings::new(store);
        assert_eq!(settings.load_pairing(), None);
        assert!(!settings.store().contains(Namespace::Pairing, "server_mac"));
    }

    #[test]
    fn out_of_range_radio_channel_is_treated_as_absent() {
        let mut settings = Settings::new(MemoryStore::new());
        settings.save_pairing(&PairingRecord::new(CONTROLLER, 14)).unwrap();
        assert_eq!(settings.load_pairing(), None);
    }

    #[test]
    fn fresh_store_defaults_and_heals_midi_settings() {
        let mut settings = Settings::new(MemoryStore::new());
        assert_eq!(settings.load_midi_channel(), MidiChannel::default());
        assert_eq!(settings.load_program_map(4), ProgramChangeMap::identity(4));
        assert!(settings.store().contains(Namespace::MidiChannel, "channel"));
        assert!(settings.store().contains(Namespace::MidiMap, "map"));
    }

    #[test]
    fn out_of_range_midi_channel_is_healed_and_rewritten() {
        for raw in [0, 17] {
            let mut store = MemoryStore::new();
            stamp(&mut store, Namespace::MidiChannel, STORAGE_VERSION);
            store.put(Namespace::MidiChannel, "channel", &[raw]).unwrap();

            let mut settings = Settings::new(store);
            assert_eq!(settings.load_midi_channel(), MidiChannel::default());
            let mut buf = [0; 1];
            let stored = settings
                .store
                .get(Namespace::MidiChannel, "channel", &mut buf)
                .unwrap();
            assert_eq!((stored, buf[0]), (Some(1), 1));
            assert!(settings.version_matches(Namespace::MidiChannel).unwrap());
        }
    }

    #[test]
    fn short_program_map_is_healed_and_rewritten() {
        let mut store = MemoryStore::new();
        stamp(&mut store, Namespace::MidiMap, STORAGE_VERSION);
        store.put(Namespace::MidiMap, "map", &[0, 1, 2]).unwrap();

        let mut settings = Settings::new(store);
        assert_eq!(settings.load_program_map(4), ProgramChangeMap::identity(4));
        assert!(settings.store().contains(Namespace::MidiMap, "map"));
        assert_eq!(settings.load_program_map(4), ProgramChangeMap::identity(4));
    }

    #[test]
    fn out_of_range_log_level_is_healed_and_rewritten() {
        let mut store = MemoryStore::new();
        stamp(&mut store, Namespace::Logging, STORAGE_VERSION);
        store.put(Namespace::Logging, "log_level", &[9]).unwrap();

        let mut settings = Settings::new(store);
        assert_eq!(settings.load_log_level(), LogLevel::Info);
        let mut buf = [0; 1];
        let stored = settings
            .store
            .get(Namespace::Logging, "log_level", &mut buf)
            .unwrap();
        assert_eq!((stored, buf[0]), (Some(1), LogLevel::Info as u8));
    }

    #[test]
    fn program_map_round_trips() {
        let mut settings = Settings::new(MemoryStore::new());
        let mut map = ProgramChangeMap::identity(4);
        map.bind(2, 42).unwrap();
        settings.save_program_map(&map).unwrap();
        assert_eq!(settings.load_program_map(4), map);
    }

    #[test]
    fn log_level_defaults_to_info() {
        let mut settings = Settings::new(MemoryStore::new());
        assert_eq!(settings.load_log_level(), LogLevel::Info);
        settings.save_log_level(LogLevel::Debug).unwrap();
        assert_eq!(settings.load_log_level(), LogLevel::Debug);
    }

    #[test]
    fn clear_only_touches_one_namespace() {
        let mut settings = Settings::new(MemoryStore::new());
        settings.save_pairing(&PairingRecord::new(CONTROLLER, 1)).unwrap();
        settings.save_midi_channel(MidiChannel::new(9).unwrap()).unwrap();
        settings.clear_pairing().unwrap();
        assert_eq!(settings.load_pairing(), None);
        assert_eq!(settings.load_midi_channel().get(), 9);
    }
}
