//! Path resolution and environment overrides (spec §6).
//!
//! Follows the teacher's XDG-path idiom (`config.rs`/`utils.rs`): check the
//! XDG env var, then fall back to a `$HOME`-relative default.

use std::path::PathBuf;

/// Resolves the data directory holding `paired_devices.json` and `settings.json`.
/// `DATA_DIR` overrides the default outright (spec §6).
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DATA_DIR") {
        return PathBuf::from(dir);
    }
    let base = std::env::var("XDG_DATA_HOME")
        .unwrap_or_else(|_| format!("{}/.local/share", std::env::var("HOME").unwrap_or_default()));
    PathBuf::from(base).join("btaudiod")
}

pub fn paired_devices_path() -> PathBuf {
    data_dir().join("paired_devices.json")
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn mpd_runtime_dir() -> PathBuf {
    data_dir().join("mpd")
}

/// `LOG_LEVEL` overrides `GlobalSettings::log_level` at startup only (spec §6).
pub fn log_level_override() -> Option<crate::model::LogLevel> {
    use crate::model::LogLevel;
    match std::env::var("LOG_LEVEL").ok()?.to_ascii_lowercase().as_str() {
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warning" | "warn" => Some(LogLevel::Warning),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

/// PulseAudio socket probe order (spec §4.6, §6): `PULSE_SERVER` env, then a
/// small set of known paths.
pub fn pulse_server_candidates() -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(explicit) = std::env::var("PULSE_SERVER") {
        candidates.push(explicit);
    }
    candidates.push("unix:/run/audio/pulse.sock".to_string());
    candidates.push("unix:/run/audio/native".to_string());
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        candidates.push(format!("unix:{runtime_dir}/pulse/native"));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn data_dir_honors_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("DATA_DIR", "/tmp/btaudiod-test") };
        assert_eq!(data_dir(), PathBuf::from("/tmp/btaudiod-test"));
        unsafe { std::env::remove_var("DATA_DIR") };
    }

    #[test]
    fn log_level_override_parses_known_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("LOG_LEVEL", "warning") };
        assert!(matches!(log_level_override(), Some(crate::model::LogLevel::Warning)));
        unsafe { std::env::remove_var("LOG_LEVEL") };
    }
}
