//! [`KeyValueStore`] over a range of NOR flash.
//!
//! Entries live in a `sequential-storage` map keyed by namespace and key
//! name. Clearing a namespace overwrites its keys with empty values, which
//! read back as absent. The flash is expected to be blocking underneath, so
//! the map futures are driven to completion in place.

use core::ops::Range;

use embassy_futures::block_on;
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{fetch_item, store_item};

use crate::error::StoreError;
use crate::store::{KeyValueStore, Namespace};

const KEY_LEN: usize = 16;
const BUFFER_LEN: usize = 64;

type FlashKey = [u8; KEY_LEN];

pub struct FlashStore<F> {
    flash: F,
    range: Range<u32>,
    cache: NoCache,
    buffer: [u8; BUFFER_LEN],
}

impl<F: NorFlash> FlashStore<F> {
    /// Use `range` of `flash`; it must span at least two erase pages.
    pub fn new(flash: F, range: Range<u32>) -> Self {
        Self {
            flash,
            range,
            cache: NoCache::new(),
            buffer: [0; BUFFER_LEN],
        }
    }

    fn key(namespace: Namespace, key: &str) -> Result<FlashKey, StoreError> {
        let mut out = [0; KEY_LEN];
        out[0] = namespace as u8 + 1;
        out.get_mut(1..=key.len())
            .ok_or(StoreError::ValueTooLarge)?
            .copy_from_slice(key.as_bytes());
        Ok(out)
    }
}

fn store_error<E>(err: sequential_storage::Error<E>) -> StoreError {
    match err {
        sequential_storage::Error::FullStorage => StoreError::Full,
        sequential_storage::Error::BufferTooSmall(_) => StoreError::ValueTooLarge,
        _ => StoreError::Backend,
    }
}

impl<F: NorFlash> KeyValueStore for FlashStore<F> {
    fn get(
        &mut self,
        namespace: Namespace,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        let key = Self::key(namespace, key)?;
        let value: Option<&[u8]> = block_on(fetch_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buffer,
            &key,
        ))
        .map_err(store_error)?;
        match value {
            Some(value) if !value.is_empty() => {
                buf.get_mut(..value.len())
                    .ok_or(StoreError::ValueTooLarge)?
                    .copy_from_slice(value);
                Ok(Some(value.len()))
            }
            _ => Ok(None),
        }
    }

    fn put(&mut self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = Self::key(namespace, key)?;
        block_on(store_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buffer,
            &key,
            &value,
        ))
        .map_err(store_error)
    }

    fn clear(&mut self, namespace: Namespace) -> Result<(), StoreError> {
        for key in namespace.keys() {
            self.put(namespace, key, &[])?;
        }
        debug!("[flash] cleared {}", namespace.name());
        Ok(())
    }
}
