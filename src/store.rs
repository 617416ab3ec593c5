//! Atomic on-disk JSON store of paired devices + global settings (spec §4.1).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::event_bus::{Event, EventBus};
use crate::model::{DeviceAddress, DevicePatch, GlobalSettings, PersistedDevice, SettingsPatch};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub devices: Vec<PersistedDevice>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

pub struct Store {
    devices_path: PathBuf,
    settings_path: PathBuf,
    doc: RwLock<StoreDocument>,
    event_bus: EventBus,
}

impl Store {
    /// Loads the store from disk. An absent file initializes to an empty
    /// document; a malformed file is a fatal `StoreCorrupt` (spec §4.1).
    ///
    /// Publishes no events of its own accord: the returned store is wired
    /// to a no-op bus until [`Store::with_event_bus`] attaches the real one,
    /// so callers that only need to inspect the document at startup (tests,
    /// one-shot tooling) don't have to thread a bus through.
    pub async fn load(devices_path: PathBuf, settings_path: PathBuf) -> Result<Self, CoreError> {
        let devices = match tokio::fs::read_to_string(&devices_path).await {
            Ok(contents) => serde_json::from_str::<Vec<PersistedDevice>>(&contents)
                .map_err(|e| CoreError::StoreCorrupt(format!("{}: {e}", devices_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let settings = match tokio::fs::read_to_string(&settings_path).await {
            Ok(contents) => serde_json::from_str::<GlobalSettings>(&contents)
                .map_err(|e| CoreError::StoreCorrupt(format!("{}: {e}", settings_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GlobalSettings::default(),
            Err(e) => return Err(e.into()),
        };
        validate_unique_ports(&devices)?;
        validate_unique_addresses(&devices)?;
        Ok(Self {
            devices_path,
            settings_path,
            doc: RwLock::new(StoreDocument { devices, settings }),
            event_bus: EventBus::new(),
        })
    }

    /// Attaches the event bus that [`Event::StoreChanged`] is published on
    /// after every successful write (spec §4.1). Replaces whatever bus
    /// [`Store::load`] created, so call this once during context assembly.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub async fn devices(&self) -> Vec<PersistedDevice> {
        self.doc.read().await.devices.clone()
    }

    pub async fn get_device(&self, address: &DeviceAddress) -> Option<PersistedDevice> {
        self.doc
            .read()
            .await
            .devices
            .iter()
            .find(|d| &d.address == address)
            .cloned()
    }

    pub async fn get_settings(&self) -> GlobalSettings {
        self.doc.read().await.settings.clone()
    }

    pub async fn put_settings(&self, patch: &SettingsPatch) -> Result<GlobalSettings, CoreError> {
        let mut guard = self.doc.write().await;
        patch.apply(&mut guard.settings);
        let settings = guard.settings.clone();
        self.persist(&guard).await?;
        Ok(settings)
    }

    /// Inserts a newly paired device, or replaces the existing entry for the
    /// same address (store Invariant 1: at most one entry per MAC).
    pub async fn upsert_device(&self, device: PersistedDevice) -> Result<(), CoreError> {
        device.validate()?;
        let mut guard = self.doc.write().await;
        if let Some(port) = device.mpd_port
            && guard
                .devices
                .iter()
                .any(|d| d.address != device.address && d.mpd_port == Some(port))
        {
            return Err(CoreError::InvalidPatch(format!("mpd_port {port} already in use")));
        }
        if let Some(existing) = guard.devices.iter_mut().find(|d| d.address == device.address) {
            *existing = device;
        } else {
            guard.devices.push(device);
        }
        self.persist(&guard).await
    }

    pub async fn update_device(
        &self,
        address: &DeviceAddress,
        patch: &DevicePatch,
    ) -> Result<PersistedDevice, CoreError> {
        let mut guard = self.doc.write().await;
        let mut updated = guard
            .devices
            .iter()
            .find(|d| &d.address == address)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDevice(address.to_string()))?;
        patch.apply(&mut updated);
        updated.validate()?;
        if let Some(port) = updated.mpd_port
            && guard
                .devices
                .iter()
                .any(|d| &d.address != address && d.mpd_port == Some(port))
        {
            return Err(CoreError::InvalidPatch(format!("mpd_port {port} already in use")));
        }
        if let Some(existing) = guard.devices.iter_mut().find(|d| &d.address == address) {
            *existing = updated.clone();
        }
        self.persist(&guard).await?;
        Ok(updated)
    }

    pub async fn remove_device(&self, address: &DeviceAddress) -> Result<(), CoreError> {
        let mut guard = self.doc.write().await;
        guard.devices.retain(|d| &d.address != address);
        self.persist(&guard).await
    }

    /// Serializes the whole document and atomically replaces the two on-disk
    /// files: write to a sibling `.tmp`, fsync, then rename (spec §4.1,
    /// property law 2 — the file reflects either the new state in full or
    /// the prior state, never a partial write).
    async fn persist(&self, doc: &StoreDocument) -> Result<(), CoreError> {
        atomic_write_json(&self.devices_path, &doc.devices).await?;
        atomic_write_json(&self.settings_path, &doc.settings).await?;
        self.event_bus.publish(Event::StoreChanged);
        Ok(())
    }
}

async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn validate_unique_ports(devices: &[PersistedDevice]) -> Result<(), CoreError> {
    let mut seen = std::collections::HashSet::new();
    for device in devices {
        if let Some(port) = device.mpd_port
            && !seen.insert(port)
        {
            return Err(CoreError::StoreCorrupt(format!("duplicate mpd_port {port}")));
        }
    }
    Ok(())
}

fn validate_unique_addresses(devices: &[PersistedDevice]) -> Result<(), CoreError> {
    let mut seen = std::collections::HashSet::new();
    for device in devices {
        if !seen.insert(&device.address) {
            return Err(CoreError::StoreCorrupt(format!("duplicate address {}", device.address)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(addr: &str) -> PersistedDevice {
        PersistedDevice::new_default(DeviceAddress::parse(addr).unwrap(), "Speaker".into())
    }

    async fn new_temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let devices = dir.path().join("paired_devices.json");
        let settings = dir.path().join("settings.json");
        let store = Store::load(devices, settings).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn absent_file_initializes_empty() {
        let (store, _dir) = new_temp_store().await;
        assert!(store.devices().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_then_reload_round_trips() {
        let (store, dir) = new_temp_store().await;
        store.upsert_device(sample_device("AA:BB:CC:DD:EE:01")).await.unwrap();

        let reloaded = Store::load(
            dir.path().join("paired_devices.json"),
            dir.path().join("settings.json"),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let devices_path = dir.path().join("paired_devices.json");
        tokio::fs::write(&devices_path, b"not json").await.unwrap();
        let err = Store::load(devices_path, dir.path().join("settings.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StoreCorrupt(_)));
    }

    #[tokio::test]
    async fn mpd_port_uniqueness_is_enforced() {
        let (store, _dir) = new_temp_store().await;
        let mut a = sample_device("AA:BB:CC:DD:EE:01");
        a.mpd_port = Some(6600);
        store.upsert_device(a).await.unwrap();

        let mut b = sample_device("AA:BB:CC:DD:EE:02");
        b.mpd_port = Some(6600);
        let err = store.upsert_device(b).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidPatch(_)));
    }

    #[tokio::test]
    async fn successful_write_publishes_store_changed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = crate::event_bus::EventBus::new();
        let mut sub = bus.subscribe(crate::event_bus::ReplayRequest::default());
        let store = Store::load(dir.path().join("paired_devices.json"), dir.path().join("settings.json"))
            .await
            .unwrap()
            .with_event_bus(bus);

        store.upsert_device(sample_device("AA:BB:CC:DD:EE:01")).await.unwrap();
        assert!(matches!(sub.rx.try_recv().unwrap(), Event::StoreChanged));
    }

    #[tokio::test]
    async fn remove_device_omits_it_afterwards() {
        let (store, _dir) = new_temp_store().await;
        let addr = DeviceAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        store.upsert_device(sample_device(addr.as_str())).await.unwrap();
        store.remove_device(&addr).await.unwrap();
        assert!(store.get_device(&addr).await.is_none());
    }
}
