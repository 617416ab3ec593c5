//! `org.bluez.Adapter1` wrapper (spec §4.3).
//!
//! Grounded on the teacher's `main.rs` adapter setup (`bluer::Session::new`,
//! `session.default_adapter()`, `adapter.set_powered(true)`) and
//! `bluetooth/discovery.rs` (`adapter.device_addresses()`).

use std::collections::BTreeSet;
use std::str::FromStr;

use bluer::{AdapterEvent, DiscoveryFilter, DiscoveryTransport};
use futures::{Stream, StreamExt};
use log::{debug, info};
use uuid::Uuid;

use crate::bluez::{device::BluezDevice, DISCOVERY_UUIDS};
use crate::error::CoreError;
use crate::model::DeviceAddress;

pub struct BluezAdapter {
    inner: bluer::Adapter,
}

impl BluezAdapter {
    pub fn new(inner: bluer::Adapter) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn address(&self) -> Result<DeviceAddress, CoreError> {
        let addr = self.inner.address().await?;
        DeviceAddress::try_from(addr)
    }

    pub async fn is_powered(&self) -> Result<bool, CoreError> {
        Ok(self.inner.is_powered().await?)
    }

    pub async fn is_present(&self) -> bool {
        self.inner.address().await.is_ok()
    }

    pub async fn device(&self, address: &DeviceAddress) -> Result<BluezDevice, CoreError> {
        let addr = bluer::Address::from_str(address.as_str())
            .map_err(|_| CoreError::InvalidAddress(address.to_string()))?;
        let device = self.inner.device(addr)?;
        Ok(BluezDevice::new(device))
    }

    pub async fn device_addresses(&self) -> Result<Vec<DeviceAddress>, CoreError> {
        let addrs = self.inner.device_addresses().await?;
        Ok(addrs.into_iter().filter_map(|a| DeviceAddress::try_from(a).ok()).collect())
    }

    pub async fn remove_device(&self, address: &DeviceAddress) -> Result<(), CoreError> {
        let addr = bluer::Address::from_str(address.as_str())
            .map_err(|_| CoreError::InvalidAddress(address.to_string()))?;
        Ok(self.inner.remove_device(addr).await?)
    }

    /// Starts discovery with the BR/EDR + A2DP/AVRCP/HFP/HSP filter always
    /// applied (spec §4.3). BlueZ ref-counts discovery per D-Bus client, so
    /// this never interferes with another daemon's LE scan.
    pub async fn start_discovery(&self) -> Result<impl Stream<Item = AdapterEvent>, CoreError> {
        let uuids: BTreeSet<Uuid> = DISCOVERY_UUIDS
            .iter()
            .filter_map(|u| Uuid::parse_str(u).ok())
            .collect();
        self.inner
            .set_discovery_filter(DiscoveryFilter {
                uuids,
                transport: DiscoveryTransport::BrEdr,
                ..Default::default()
            })
            .await?;
        info!("starting discovery on adapter {}", self.inner.name());
        let events = self.inner.discover_devices().await?;
        Ok(events)
    }

    pub async fn stop_discovery(&self) -> Result<(), CoreError> {
        debug!("stopping discovery on adapter {}", self.inner.name());
        // bluer stops discovery automatically once every stream consumer
        // for this session is dropped; nothing else to do for our one client.
        Ok(())
    }
}

/// Resolves the adapter to use for the daemon (spec §3 invariant 5, §4.10
/// step 3): the configured adapter if present, else the first powered
/// adapter, else the first present adapter. Boot fails if none exist.
pub async fn resolve_adapter(session: &bluer::Session, selected: &str) -> Result<BluezAdapter, CoreError> {
    let names = session.adapter_names().await.map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;
    if names.is_empty() {
        return Err(CoreError::AdapterNotFound);
    }

    if selected != crate::model::GlobalSettings::SELECTED_ADAPTER_AUTO {
        for name in &names {
            let adapter = session.adapter(name).map_err(CoreError::from)?;
            if let Ok(addr) = adapter.address().await
                && addr.to_string().eq_ignore_ascii_case(selected)
            {
                return Ok(BluezAdapter::new(adapter));
            }
        }
    }

    for name in &names {
        let adapter = session.adapter(name).map_err(CoreError::from)?;
        if adapter.is_powered().await.unwrap_or(false) {
            return Ok(BluezAdapter::new(adapter));
        }
    }

    let adapter = session.adapter(&names[0]).map_err(CoreError::from)?;
    Ok(BluezAdapter::new(adapter))
}
