//! Keeps the local configuration cache in step with the device.
//!
//! Requests are fire-and-forget: the device answers on the notify channel and
//! replies are matched by config id only, so the latest notification for an
//! id always wins. Writes never touch the cache; the device confirms them with
//! a notification.

use crate::domain::config::{ConfigCacheEntry, SharedConfigCache, WELL_KNOWN_CONFIG};
use crate::domain::models::ConfigRecord;
use crate::infrastructure::bluetooth::connection::{BleConnection, CharacteristicRole, ConnectionError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Transport, WriteMode};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Configuration item '{0}' is read-only")]
    ReadOnly(String),
    #[error("Configuration item id must not be empty")]
    EmptyId,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Default)]
pub struct ConfigSynchronizer {
    cache: SharedConfigCache,
}

impl ConfigSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for observers. Entries are updated in place behind it.
    pub fn cache(&self) -> SharedConfigCache {
        self.cache.clone()
    }

    /// Ask the device to notify the current record for `id`.
    pub async fn request<T: Transport>(
        &self,
        link: &BleConnection<T>,
        id: &str,
    ) -> Result<(), SyncError> {
        if id.is_empty() {
            return Err(SyncError::EmptyId);
        }
        debug!("Requesting config '{}'", id);
        link.write(
            CharacteristicRole::ConfigRead,
            &protocol::encode_read_request(id),
            WriteMode::WithoutResponse,
        )
        .await?;
        Ok(())
    }

    /// Request every well-known config item.
    pub async fn refresh_all<T: Transport>(&self, link: &BleConnection<T>) -> Result<(), SyncError> {
        for (id, _) in WELL_KNOWN_CONFIG {
            self.request(link, id).await?;
        }
        Ok(())
    }

    /// Send `id=value`. Rejected locally if the cached entry is read-only.
    pub async fn write<T: Transport>(
        &self,
        link: &BleConnection<T>,
        id: &str,
        value: &str,
    ) -> Result<(), SyncError> {
        if id.is_empty() {
            return Err(SyncError::EmptyId);
        }
        if self.cache.lock().is_read_only(id) {
            info!("Rejecting write to read-only config '{}'", id);
            return Err(SyncError::ReadOnly(id.to_string()));
        }
        debug!("Writing config '{}' = '{}'", id, value);
        link.write(
            CharacteristicRole::ConfigWrite,
            &protocol::encode_write(id, value),
            WriteMode::WithoutResponse,
        )
        .await?;
        Ok(())
    }

    /// Trigger the shutter.
    pub async fn capture<T: Transport>(&self, link: &BleConnection<T>) -> Result<(), SyncError> {
        debug!("Triggering capture");
        link.write(
            CharacteristicRole::CaptureImage,
            protocol::CAPTURE_TRIGGER,
            WriteMode::WithoutResponse,
        )
        .await?;
        Ok(())
    }

    /// Decode a notification and upsert it. `notify` runs under the cache
    /// lock right after the update so two notifications cannot interleave
    /// their update and announcement. Malformed payloads are dropped.
    pub fn on_notification<F>(&self, payload: &[u8], notify: F) -> Option<ConfigCacheEntry>
    where
        F: FnOnce(&ConfigCacheEntry),
    {
        match protocol::decode(payload) {
            Ok(record) => Some(self.apply(record, notify)),
            Err(e) => {
                debug!("Dropping malformed config notification ({} bytes): {}", payload.len(), e);
                None
            }
        }
    }

    pub fn apply<F>(&self, record: ConfigRecord, notify: F) -> ConfigCacheEntry
    where
        F: FnOnce(&ConfigCacheEntry),
    {
        let mut cache = self.cache.lock();
        let entry = cache.upsert(record);
        trace!("Config '{}' is now '{}'", entry.id, entry.value);
        notify(entry);
        entry.clone()
    }

    /// Forget everything learned from the device.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
