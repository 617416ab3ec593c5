//! `org.bluez.Device1` wrapper (spec §4.3), including `MediaControl1` /
//! `MediaTransport1` presence checks used during connect.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::DeviceAddress;

/// Subset of `bluer::DeviceProperty` this daemon cares about, re-exposed so
/// the rest of the crate never names `bluer` types directly in its public
/// surface (spec §9 "typed messages rather than ad-hoc handlers").
#[derive(Debug, Clone)]
pub enum DeviceProperty {
    Connected(bool),
    Paired(bool),
    Rssi(Option<i16>),
    Uuids(BTreeSet<String>),
    Name(String),
    ServicesResolved(bool),
    Other,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    PropertyChanged(DeviceProperty),
}

pub struct BluezDevice {
    inner: bluer::Device,
}

impl BluezDevice {
    pub fn new(inner: bluer::Device) -> Self {
        Self { inner }
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::try_from(self.inner.address()).expect("bluer always yields a valid address")
    }

    pub async fn name(&self) -> Result<Option<String>, CoreError> {
        Ok(self.inner.name().await?)
    }

    pub async fn is_connected(&self) -> Result<bool, CoreError> {
        Ok(self.inner.is_connected().await?)
    }

    pub async fn is_paired(&self) -> Result<bool, CoreError> {
        Ok(self.inner.is_paired().await?)
    }

    pub async fn set_trusted(&self, trusted: bool) -> Result<(), CoreError> {
        Ok(self.inner.set_trusted(trusted).await?)
    }

    pub async fn uuids(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self
            .inner
            .uuids()
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|u| u.to_string())
            .collect())
    }

    pub async fn rssi(&self) -> Result<Option<i16>, CoreError> {
        Ok(self.inner.rssi().await?)
    }

    pub async fn pair(&self) -> Result<(), CoreError> {
        self.inner.pair().await.map_err(CoreError::from)
    }

    /// `Connect` with a 20s timeout (spec §5). On `Busy` the caller retries
    /// once after 1s (spec §4.10 step 3).
    pub async fn connect(&self) -> Result<(), CoreError> {
        tokio::time::timeout(Duration::from_secs(20), self.inner.connect())
            .await
            .map_err(|_| CoreError::DeviceUnreachable)?
            .map_err(CoreError::from)
    }

    /// `Disconnect` with a 10s timeout (spec §5).
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        tokio::time::timeout(Duration::from_secs(10), self.inner.disconnect())
            .await
            .map_err(|_| CoreError::DeviceUnreachable)?
            .map_err(CoreError::from)
    }

    /// Explicit profile connect, 10s timeout (spec §5, §4.10 fallback ladder
    /// step (b)).
    pub async fn connect_profile(&self, uuid: &str) -> Result<(), CoreError> {
        let uuid = Uuid::parse_str(uuid).map_err(|e| CoreError::BlueZUnknown(e.to_string()))?;
        tokio::time::timeout(Duration::from_secs(10), self.inner.connect_profile(&uuid))
            .await
            .map_err(|_| CoreError::DeviceUnreachable)?
            .map_err(CoreError::from)
    }

    /// Whether `MediaTransport1` is exposed for this device yet (spec §4.10
    /// step 4: "wait up to 10s for the service interfaces to appear"). Goes
    /// straight to the bus's `ObjectManager` since `bluer`'s typed `Device`
    /// only covers `Device1` itself.
    pub async fn has_media_transport(&self, conn: &zbus::Connection, adapter_name: &str) -> bool {
        let device_path = format!("/org/bluez/{adapter_name}/dev_{}", self.address().path_form());
        let Ok(manager) = zbus::fdo::ObjectManagerProxy::builder(conn)
            .destination("org.bluez")
            .unwrap()
            .path("/")
            .unwrap()
            .build()
            .await
        else {
            return false;
        };
        let Ok(objects) = manager.get_managed_objects().await else {
            return false;
        };
        objects.iter().any(|(path, interfaces)| {
            path.as_str().starts_with(&device_path) && interfaces.contains_key("org.bluez.MediaTransport1")
        })
    }

    pub async fn events(&self) -> Result<impl Stream<Item = DeviceEvent>, CoreError> {
        let stream = self.inner.events().await?;
        Ok(stream.filter_map(|event| async move {
            match event {
                bluer::DeviceEvent::PropertyChanged(prop) => Some(DeviceEvent::PropertyChanged(map_property(prop))),
            }
        }))
    }
}

fn map_property(prop: bluer::DeviceProperty) -> DeviceProperty {
    match prop {
        bluer::DeviceProperty::Connected(v) => DeviceProperty::Connected(v),
        bluer::DeviceProperty::Paired(v) => DeviceProperty::Paired(v),
        bluer::DeviceProperty::Rssi(v) => DeviceProperty::Rssi(Some(v)),
        bluer::DeviceProperty::Uuids(v) => DeviceProperty::Uuids(v.into_iter().map(|u| u.to_string()).collect()),
        bluer::DeviceProperty::Name(v) => DeviceProperty::Name(v),
        bluer::DeviceProperty::ServicesResolved(v) => DeviceProperty::ServicesResolved(v),
        _ => DeviceProperty::Other,
    }
}
