//! Paired devices and their symmetric keys.

use keyferry_proto::DeviceKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

/// Errors from a [`SealedDeviceStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing has been stored yet.
    #[error("no paired devices stored")]
    NotPaired,
    /// The store exists but cannot be read, written or authenticated.
    #[error("device store unavailable: {0}")]
    Unavailable(String),
}

/// One paired device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Identifier carried in every frame from this device.
    pub device_id: String,
    /// Symmetric key shared with the device.
    #[serde(rename = "key_hex")]
    pub key: DeviceKey,
    /// Pairing time, Unix milliseconds.
    pub created_at_ms: u64,
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("device_id", &self.device_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

/// Persistent storage for device records, sealed at rest by the implementor.
pub trait SealedDeviceStore: Send + Sync {
    /// Loads every stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotPaired`] if nothing was ever saved and
    /// [`StoreError::Unavailable`] on any read or authentication failure.
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Replaces the stored set with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the write did not complete.
    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError>;
}

/// In-memory view of paired devices, written through to a store.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    store: Arc<dyn SealedDeviceStore>,
}

impl DeviceRegistry {
    /// Loads the registry from `store`. An empty store yields an empty
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be read.
    pub fn load(store: Arc<dyn SealedDeviceStore>) -> Result<Self, StoreError> {
        let records = match store.load() {
            Ok(records) => records,
            Err(StoreError::NotPaired) => Vec::new(),
            Err(e) => return Err(e),
        };
        info!(devices = records.len(), "device registry loaded");
        let devices = records
            .into_iter()
            .map(|r| (r.device_id.clone(), r))
            .collect();
        Ok(Self {
            devices: RwLock::new(devices),
            store,
        })
    }

    /// Copy of the key for `device_id`.
    #[must_use]
    pub fn key_for(&self, device_id: &str) -> Option<DeviceKey> {
        self.read().get(device_id).map(|r| r.key.clone())
    }

    /// Whether `device_id` is paired.
    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    /// Number of paired devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no device is paired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces a record.
    ///
    /// The new set is persisted first and only then published in memory, so
    /// a failed write leaves the registry unchanged. Blocking; call from a
    /// blocking context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if persisting fails.
    pub fn upsert(&self, record: DeviceRecord) -> Result<(), StoreError> {
        let mut snapshot: Vec<DeviceRecord> = self
            .read()
            .values()
            .filter(|r| r.device_id != record.device_id)
            .cloned()
            .collect();
        snapshot.push(record.clone());
        snapshot.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        self.store.save(&snapshot)?;

        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.device_id.clone(), record);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(id: &str, byte: u8) -> DeviceRecord {
        DeviceRecord {
            device_id: id.into(),
            key: DeviceKey::from_bytes([byte; 32]),
            created_at_ms: 1,
        }
    }

    struct FailingStore;

    impl SealedDeviceStore for FailingStore {
        fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
            Err(StoreError::NotPaired)
        }

        fn save(&self, _: &[DeviceRecord]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    #[test]
    fn upsert_persists_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let reg = DeviceRegistry::load(store.clone()).unwrap();
        reg.upsert(record("phone", 1)).unwrap();
        assert_eq!(reg.key_for("phone").unwrap().as_bytes(), &[1u8; 32]);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let reg = DeviceRegistry::load(Arc::new(MemoryStore::new())).unwrap();
        reg.upsert(record("phone", 1)).unwrap();
        reg.upsert(record("phone", 2)).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.key_for("phone").unwrap().as_bytes(), &[2u8; 32]);
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() {
        let reg = DeviceRegistry::load(Arc::new(FailingStore)).unwrap();
        assert!(reg.upsert(record("phone", 1)).is_err());
        assert!(!reg.contains("phone"));
    }

    #[test]
    fn load_restores_records() {
        let store = Arc::new(MemoryStore::new());
        store.save(&[record("a", 1), record("b", 2)]).unwrap();
        let reg = DeviceRegistry::load(store).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.contains("b"));
    }

    #[test]
    fn record_serializes_key_as_hex() {
        let json = serde_json::to_string(&record("a", 0xAB)).unwrap();
        assert!(json.contains(&"ab".repeat(32)));
        let back: DeviceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record("a", 0xAB));
    }

    #[test]
    fn debug_output_hides_key() {
        let dbg = format!("{:?}", record("a", 0xAB));
        assert!(!dbg.contains("abab"));
    }
}
