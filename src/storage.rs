use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    types::{WearableDevice, DEVICE_HISTORY_LIMIT},
};

/// Key of the currently paired device record
pub const CONNECTED_DEVICE_KEY: &str = "@connected_device";
/// Key of the paired device history list
pub const DEVICE_HISTORY_KEY: &str = "@device_history";

/// Version written into every persisted envelope
pub const SCHEMA_VERSION: u32 = 1;

/// Opaque string key-value persistence provided by the host platform
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Delete a value, succeeding if it does not exist
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process [`KeyValueStore`], nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    data: Value,
}

/// Persist `value` under `key` wrapped in a versioned envelope
///
/// # Errors
///
/// Returns [`crate::WearableError::Json`] if the value cannot be serialized,
/// or the store's error if the write fails.
pub async fn save_versioned<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let blob = serde_json::to_string(&EnvelopeRef {
        version: SCHEMA_VERSION,
        data: value,
    })?;
    store.set(key, blob).await
}

/// Load a value written by [`save_versioned`]
///
/// Blobs written before envelopes existed are read as version 0. Blobs from
/// a newer schema, or blobs that fail to decode, are treated as absent.
///
/// # Errors
///
/// Only the store's own read error is returned.
pub async fn load_versioned<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    let Some(blob) = store.get(key).await? else {
        return Ok(None);
    };

    let raw: Value = match serde_json::from_str(&blob) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Ignoring unreadable value under {}: {}", key, e);
            return Ok(None);
        }
    };

    let data = match serde_json::from_value::<Envelope>(raw.clone()) {
        Ok(envelope) if envelope.version > SCHEMA_VERSION => {
            warn!(
                "Ignoring {} written by schema version {} (supported: {})",
                key, envelope.version, SCHEMA_VERSION
            );
            return Ok(None);
        }
        Ok(envelope) => envelope.data,
        Err(_) => {
            debug!("Reading unversioned value under {}", key);
            raw
        }
    };

    match serde_json::from_value(data) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Ignoring undecodable value under {}: {}", key, e);
            Ok(None)
        }
    }
}

/// Persistence of the paired device and the pairing history
#[derive(Clone)]
pub struct DeviceStore {
    store: Arc<dyn KeyValueStore>,
    history_limit: usize,
}

impl DeviceStore {
    /// Create a device store on top of a key-value store
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            history_limit: DEVICE_HISTORY_LIMIT,
        }
    }

    /// Save the currently paired device
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn save_connected_device(&self, device: &WearableDevice) -> Result<()> {
        save_versioned(self.store.as_ref(), CONNECTED_DEVICE_KEY, device).await?;
        info!("Device saved: {}", device.name);
        Ok(())
    }

    /// Load the currently paired device
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn connected_device(&self) -> Result<Option<WearableDevice>> {
        load_versioned(self.store.as_ref(), CONNECTED_DEVICE_KEY).await
    }

    /// Forget the currently paired device, history is untouched
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn remove_connected_device(&self) -> Result<()> {
        self.store.remove(CONNECTED_DEVICE_KEY).await?;
        info!("Connected device removed");
        Ok(())
    }

    /// Update the connectivity flag of the saved device, if any
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn update_connection_status(&self, connected: bool) -> Result<()> {
        if let Some(device) = self.connected_device().await? {
            self.save_connected_device(&device.with_connected(connected))
                .await?;
            debug!("Connection status updated: {}", connected);
        }
        Ok(())
    }

    /// Update the battery level of the saved device, if any
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn update_battery_level(&self, battery: i16) -> Result<()> {
        if let Some(mut device) = self.connected_device().await? {
            device.battery = battery;
            self.save_connected_device(&device).await?;
            self.update_history_entry(&device.id, |entry| entry.battery = battery)
                .await?;
            debug!("Battery level updated: {}", battery);
        }
        Ok(())
    }

    /// Modify the history entry of `device_id` in place, returning whether it exists
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn update_history_entry(
        &self,
        device_id: &str,
        update: impl FnOnce(&mut WearableDevice) + Send,
    ) -> Result<bool> {
        let mut history = self.history().await?;
        let Some(entry) = history.iter_mut().find(|entry| entry.id == device_id) else {
            return Ok(false);
        };
        update(entry);

        save_versioned(self.store.as_ref(), DEVICE_HISTORY_KEY, &history).await?;
        Ok(true)
    }

    /// Pairing history, most recent first
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn history(&self) -> Result<Vec<WearableDevice>> {
        Ok(load_versioned(self.store.as_ref(), DEVICE_HISTORY_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Look up a device in the history
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn history_entry(&self, device_id: &str) -> Result<Option<WearableDevice>> {
        Ok(self
            .history()
            .await?
            .into_iter()
            .find(|device| device.id == device_id))
    }

    /// Move `device` to the front of the history
    ///
    /// Any older entry with the same id is replaced and the list is capped.
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn push_history(&self, device: &WearableDevice) -> Result<Vec<WearableDevice>> {
        let mut history = self.history().await?;
        history.retain(|entry| entry.id != device.id);
        history.insert(0, device.clone());
        history.truncate(self.history_limit);

        save_versioned(self.store.as_ref(), DEVICE_HISTORY_KEY, &history).await?;
        Ok(history)
    }

    /// Remove a device from the history, returning whether it was present
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn remove_from_history(&self, device_id: &str) -> Result<bool> {
        let mut history = self.history().await?;
        let before = history.len();
        history.retain(|entry| entry.id != device_id);
        if history.len() == before {
            return Ok(false);
        }

        save_versioned(self.store.as_ref(), DEVICE_HISTORY_KEY, &history).await?;
        info!("Device {} removed from history", device_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BATTERY_UNKNOWN;
    use tokio_test::assert_ok;

    fn device_store() -> (Arc<MemoryStore>, DeviceStore) {
        let store = Arc::new(MemoryStore::default());
        (store.clone(), DeviceStore::new(store))
    }

    #[tokio::test]
    async fn test_connected_device_lifecycle() {
        let (_, devices) = device_store();
        assert!(devices.connected_device().await.unwrap().is_none());

        let watch = WearableDevice::new("AA:01", "Watch S3").with_connected(true);
        assert_ok!(devices.save_connected_device(&watch).await);
        assert_ok!(devices.update_battery_level(65).await);
        assert_ok!(devices.update_connection_status(false).await);

        let stored = devices.connected_device().await.unwrap().unwrap();
        assert_eq!(stored.id, "AA:01");
        assert_eq!(stored.battery, 65);
        assert!(!stored.connected);

        assert_ok!(devices.remove_connected_device().await);
        assert!(devices.connected_device().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_updates_without_device_are_noops() {
        let (store, devices) = device_store();
        assert_ok!(devices.update_connection_status(true).await);
        assert_ok!(devices.update_battery_level(40).await);
        assert!(store.get(CONNECTED_DEVICE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_deduplicated() {
        let (_, devices) = device_store();
        for i in 0..11 {
            let device = WearableDevice::new(format!("dev-{i}"), format!("Watch {i}"));
            devices.push_history(&device).await.unwrap();
        }

        let history = devices.history().await.unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].id, "dev-10");
        assert_eq!(history[9].id, "dev-1");

        let mut ids: Vec<_> = history.iter().map(|d| d.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);

        // Reconnecting to an old entry moves it to the front without duplicating it
        let history = devices
            .push_history(&WearableDevice::new("dev-5", "Watch 5"))
            .await
            .unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].id, "dev-5");
        assert_eq!(history.iter().filter(|d| d.id == "dev-5").count(), 1);
    }

    #[tokio::test]
    async fn test_battery_level_reaches_history() {
        let (_, devices) = device_store();
        let watch = WearableDevice::new("AA:01", "Watch S3").with_connected(true);
        devices.save_connected_device(&watch).await.unwrap();
        devices.push_history(&watch).await.unwrap();
        devices
            .push_history(&WearableDevice::new("AA:02", "Band"))
            .await
            .unwrap();

        assert_ok!(devices.update_battery_level(42).await);

        assert_eq!(devices.history_entry("AA:01").await.unwrap().unwrap().battery, 42);
        assert_eq!(
            devices.history_entry("AA:02").await.unwrap().unwrap().battery,
            BATTERY_UNKNOWN
        );
        assert!(!devices
            .update_history_entry("missing", |entry| entry.battery = 1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_remove_from_history() {
        let (_, devices) = device_store();
        devices
            .push_history(&WearableDevice::new("a", "A"))
            .await
            .unwrap();
        devices
            .push_history(&WearableDevice::new("b", "B"))
            .await
            .unwrap();

        assert!(devices.remove_from_history("a").await.unwrap());
        assert!(!devices.remove_from_history("a").await.unwrap());
        assert!(devices.history_entry("a").await.unwrap().is_none());
        assert!(devices.history_entry("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_envelope_is_versioned() {
        let (store, devices) = device_store();
        devices
            .save_connected_device(&WearableDevice::new("x", "X"))
            .await
            .unwrap();

        let raw: Value =
            serde_json::from_str(&store.get(CONNECTED_DEVICE_KEY).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(raw["version"], SCHEMA_VERSION);
        assert_eq!(raw["data"]["id"], "x");
    }

    #[tokio::test]
    async fn test_legacy_and_future_blobs() {
        let (store, devices) = device_store();

        store
            .set(
                CONNECTED_DEVICE_KEY,
                r#"{"id":"old","name":"Legacy","type":"band","connected":true,"battery":80}"#
                    .to_string(),
            )
            .await
            .unwrap();
        let legacy = devices.connected_device().await.unwrap().unwrap();
        assert_eq!(legacy.device_type, "band");
        assert_eq!(legacy.battery, 80);

        store
            .set(
                CONNECTED_DEVICE_KEY,
                r#"{"version":99,"data":{"id":"new","name":"Future"}}"#.to_string(),
            )
            .await
            .unwrap();
        assert!(devices.connected_device().await.unwrap().is_none());

        store
            .set(CONNECTED_DEVICE_KEY, "not json".to_string())
            .await
            .unwrap();
        assert!(devices.connected_device().await.unwrap().is_none());
    }
}
