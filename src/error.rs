//! Discriminated error kinds (spec §7). Each carries a human-readable detail
//! and maps to exactly one of the propagation policies the spec names:
//! local-recovery, degrade, surface-to-caller, or fatal.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("the speaker went out of range or failed to respond")]
    DeviceUnreachable,

    #[error("device refused pairing — clear the speaker's paired list and try again")]
    AuthRejected,

    #[error("a Bluetooth operation is already in progress for this device")]
    Busy,

    #[error("this device is already paired")]
    AlreadyPaired,

    #[error("unexpected BlueZ error: {0}")]
    BlueZUnknown(String),

    #[error("failed to activate the audio profile for this device")]
    AudioProfileFailed,

    #[error("timed out waiting for the PulseAudio sink to appear")]
    SinkTimeout,

    #[error("no free MPD port available in 6600-6609")]
    NoFreeMpdPort,

    #[error("MPD failed to stay up after repeated restarts")]
    MpdFailed,

    #[error("no Bluetooth adapter is available")]
    AdapterNotFound,

    #[error("the selected Bluetooth adapter is not powered")]
    AdapterNotPowered,

    #[error("the on-disk store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("PulseAudio is unavailable: {0}")]
    PulseUnavailable(String),

    #[error("D-Bus / BlueZ is unavailable: {0}")]
    DbusUnavailable(String),

    #[error("'{0}' is not a valid Bluetooth address")]
    InvalidAddress(String),

    #[error("device {0} is not known to this daemon")]
    UnknownDevice(String),

    #[error("invalid settings patch: {0}")]
    InvalidPatch(String),

    #[error("{0}")]
    Io(String),
}

impl CoreError {
    /// Whether this error should terminate the daemon if it occurs at startup
    /// (spec §7 "Fatal": `StoreCorrupt`, `DbusUnavailable`, `AdapterNotFound`).
    pub fn fatal_at_startup(&self) -> bool {
        matches!(
            self,
            CoreError::StoreCorrupt(_) | CoreError::DbusUnavailable(_) | CoreError::AdapterNotFound
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        CoreError::Io(value.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        CoreError::StoreCorrupt(value.to_string())
    }
}

/// Maps a raw BlueZ D-Bus error message to a [`CoreError`] kind (spec §4.3).
pub fn map_bluez_error(message: &str) -> CoreError {
    if message.contains("Page Timeout") {
        CoreError::DeviceUnreachable
    } else if message.contains("Authentication Rejected") || message.contains("Authentication Failed") {
        CoreError::AuthRejected
    } else if message.contains("In Progress") {
        CoreError::Busy
    } else if message.contains("Already Exists") || message.contains("AlreadyPaired") {
        CoreError::AlreadyPaired
    } else {
        CoreError::BlueZUnknown(message.to_string())
    }
}

impl From<bluer::Error> for CoreError {
    fn from(value: bluer::Error) -> Self {
        map_bluez_error(&value.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_bluez_errors() {
        assert!(matches!(map_bluez_error("org.bluez.Error.Failed: Page Timeout"), CoreError::DeviceUnreachable));
        assert!(matches!(map_bluez_error("Authentication Rejected"), CoreError::AuthRejected));
        assert!(matches!(map_bluez_error("Operation already in Progress"), CoreError::Busy));
        assert!(matches!(map_bluez_error("Already Exists"), CoreError::AlreadyPaired));
        assert!(matches!(map_bluez_error("some other failure"), CoreError::BlueZUnknown(_)));
    }

    #[test]
    fn fatal_classification() {
        assert!(CoreError::AdapterNotFound.fatal_at_startup());
        assert!(!CoreError::Busy.fatal_at_startup());
    }
}
