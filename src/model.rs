//! Persisted and runtime data model (spec §3).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A BR/EDR MAC address in canonical upper-case colon form, e.g. `AA:BB:CC:DD:EE:01`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let upper = raw.trim().to_ascii_uppercase();
        let octets: Vec<&str> = upper.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(CoreError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `AA:BB:CC:DD:EE:01` -> `AA_BB_CC_DD_EE_01`, BlueZ's D-Bus path / PulseAudio
    /// sink-name convention (spec §4.6).
    pub fn path_form(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = CoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl TryFrom<bluer::Address> for DeviceAddress {
    type Error = CoreError;
    fn try_from(value: bluer::Address) -> Result<Self, Self::Error> {
        Self::parse(&value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioProfile {
    A2dp,
    Hfp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleMode {
    Default,
    PowerSave,
    KeepAlive,
    AutoDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMethod {
    Infrasound,
    Silence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One paired device, as persisted to `paired_devices.json` (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub address: DeviceAddress,
    pub name: String,
    pub auto_connect: bool,
    pub paired_at: DateTime<Utc>,
    pub audio_profile: AudioProfile,
    pub idle_mode: IdleMode,
    pub keep_alive_method: KeepAliveMethod,
    pub power_save_delay_s: u32,
    pub auto_disconnect_minutes: u32,
    pub mpd_enabled: bool,
    pub mpd_port: Option<u16>,
    pub mpd_hw_volume_pct: u8,
    pub avrcp_enabled: bool,
}

impl PersistedDevice {
    pub const POWER_SAVE_DELAY_RANGE: std::ops::RangeInclusive<u32> = 0..=300;
    pub const AUTO_DISCONNECT_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 1..=1440;
    pub const MPD_PORT_RANGE: std::ops::RangeInclusive<u16> = 6600..=6609;

    pub fn new_default(address: DeviceAddress, name: String) -> Self {
        Self {
            address,
            name,
            auto_connect: true,
            paired_at: Utc::now(),
            audio_profile: AudioProfile::A2dp,
            idle_mode: IdleMode::Default,
            keep_alive_method: KeepAliveMethod::Silence,
            power_save_delay_s: 30,
            auto_disconnect_minutes: 30,
            mpd_enabled: false,
            mpd_port: None,
            mpd_hw_volume_pct: 100,
            avrcp_enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidPatch("name must not be empty".into()));
        }
        if !Self::POWER_SAVE_DELAY_RANGE.contains(&self.power_save_delay_s) {
            return Err(CoreError::InvalidPatch("power_save_delay_s out of range".into()));
        }
        if !Self::AUTO_DISCONNECT_MINUTES_RANGE.contains(&self.auto_disconnect_minutes) {
            return Err(CoreError::InvalidPatch("auto_disconnect_minutes out of range".into()));
        }
        if self.mpd_hw_volume_pct > 100 {
            return Err(CoreError::InvalidPatch("mpd_hw_volume_pct out of range".into()));
        }
        if let Some(port) = self.mpd_port
            && !Self::MPD_PORT_RANGE.contains(&port)
        {
            return Err(CoreError::InvalidPatch("mpd_port out of range".into()));
        }
        Ok(())
    }
}

/// A PATCH to a `PersistedDevice`: every field optional, unknown keys rejected at
/// the deserialization boundary (spec §9 "Dynamic config objects").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub auto_connect: Option<bool>,
    pub audio_profile: Option<AudioProfile>,
    pub idle_mode: Option<IdleMode>,
    pub keep_alive_method: Option<KeepAliveMethod>,
    pub power_save_delay_s: Option<u32>,
    pub auto_disconnect_minutes: Option<u32>,
    pub mpd_enabled: Option<bool>,
    pub mpd_port: Option<Option<u16>>,
    pub mpd_hw_volume_pct: Option<u8>,
    pub avrcp_enabled: Option<bool>,
}

impl DevicePatch {
    pub fn apply(&self, target: &mut PersistedDevice) {
        if let Some(v) = &self.name {
            target.name = v.clone();
        }
        if let Some(v) = self.auto_connect {
            target.auto_connect = v;
        }
        if let Some(v) = self.audio_profile {
            target.audio_profile = v;
        }
        if let Some(v) = self.idle_mode {
            target.idle_mode = v;
        }
        if let Some(v) = self.keep_alive_method {
            target.keep_alive_method = v;
        }
        if let Some(v) = self.power_save_delay_s {
            target.power_save_delay_s = v;
        }
        if let Some(v) = self.auto_disconnect_minutes {
            target.auto_disconnect_minutes = v;
        }
        if let Some(v) = self.mpd_enabled {
            target.mpd_enabled = v;
        }
        if let Some(v) = self.mpd_port {
            target.mpd_port = v;
        }
        if let Some(v) = self.mpd_hw_volume_pct {
            target.mpd_hw_volume_pct = v;
        }
        if let Some(v) = self.avrcp_enabled {
            target.avrcp_enabled = v;
        }
    }
}

/// Global daemon settings, persisted to `settings.json` (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub selected_adapter: String,
    pub auto_reconnect: bool,
    pub reconnect_interval_seconds: u64,
    pub reconnect_max_backoff_seconds: u64,
    pub scan_duration_seconds: u32,
    pub log_level: LogLevel,
}

impl GlobalSettings {
    pub const SELECTED_ADAPTER_AUTO: &'static str = "auto";
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            selected_adapter: Self::SELECTED_ADAPTER_AUTO.to_string(),
            auto_reconnect: true,
            reconnect_interval_seconds: 30,
            reconnect_max_backoff_seconds: 300,
            scan_duration_seconds: 30,
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub selected_adapter: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub reconnect_interval_seconds: Option<u64>,
    pub reconnect_max_backoff_seconds: Option<u64>,
    pub scan_duration_seconds: Option<u32>,
    pub log_level: Option<LogLevel>,
}

impl SettingsPatch {
    pub fn apply(&self, target: &mut GlobalSettings) {
        if let Some(v) = &self.selected_adapter {
            target.selected_adapter = v.clone();
        }
        if let Some(v) = self.auto_reconnect {
            target.auto_reconnect = v;
        }
        if let Some(v) = self.reconnect_interval_seconds {
            target.reconnect_interval_seconds = v;
        }
        if let Some(v) = self.reconnect_max_backoff_seconds {
            target.reconnect_max_backoff_seconds = v;
        }
        if let Some(v) = self.scan_duration_seconds {
            target.scan_duration_seconds = v;
        }
        if let Some(v) = self.log_level {
            target.log_level = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    Absent,
    Suspended,
    Idle,
    Running,
}

/// In-memory device state, one per managed address, never persisted directly (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDevice {
    #[serde(flatten)]
    pub persisted: PersistedDevice,
    pub present_in_bluez: bool,
    pub paired_in_bluez: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
    pub uuids: BTreeSet<String>,
    pub sink_state: SinkState,
    pub keep_alive_active: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub transitioning: bool,
}

impl RuntimeDevice {
    pub fn from_persisted(persisted: PersistedDevice) -> Self {
        Self {
            persisted,
            present_in_bluez: false,
            paired_in_bluez: false,
            connected: false,
            rssi: None,
            uuids: BTreeSet::new(),
            sink_state: SinkState::Absent,
            keep_alive_active: false,
            last_connected_at: None,
            last_disconnected_at: None,
            transitioning: false,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.persisted.address
    }
}

/// Tags what a device is doing right now (spec §9 design note), read to answer
/// "is this device busy" without an ad-hoc set. The per-device `Mutex` in
/// [`crate::coordinator::Coordinator`] still serializes the actual transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLifecycleState {
    Discovered,
    Pairing,
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Forgetting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalizes_case() {
        let addr = DeviceAddress::parse("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(addr.path_form(), "AA_BB_CC_DD_EE_01");
    }

    #[test]
    fn address_rejects_malformed() {
        assert!(DeviceAddress::parse("not-a-mac").is_err());
        assert!(DeviceAddress::parse("AA:BB:CC:DD:EE").is_err());
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let addr = DeviceAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        let mut dev = PersistedDevice::new_default(addr, "Speaker".into());
        let patch = DevicePatch {
            mpd_enabled: Some(true),
            ..Default::default()
        };
        patch.apply(&mut dev);
        assert!(dev.mpd_enabled);
        assert_eq!(dev.name, "Speaker");
    }

    #[test]
    fn patch_rejects_unknown_keys() {
        let err = serde_json::from_str::<DevicePatch>(r#"{"bogus_field": 1}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
