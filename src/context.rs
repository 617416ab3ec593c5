//! Process-wide handles threaded explicitly through the coordinator and
//! control API instead of module-level singletons (spec §9 "Globals").

use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::bluez::{BluezAdapter, PairingAgent};
use crate::event_bus::EventBus;
use crate::mpris::MprisCommand;
use crate::pulse::PulseClient;
use crate::store::Store;

/// Everything the coordinator and control API need, constructed once at
/// startup by [`crate::coordinator::Coordinator::start`] and shared behind
/// `Arc` thereafter.
pub struct Context {
    pub store: Store,
    pub event_bus: EventBus,
    pub bus: zbus::Connection,
    pub session: bluer::Session,
    pub adapter: BluezAdapter,
    pub agent: PairingAgent,
    pub pulse: PulseClient,
    /// Taken once by the coordinator's MPRIS-forwarding task at startup.
    pub mpris_commands: Mutex<Option<mpsc::UnboundedReceiver<MprisCommand>>>,
    pub mpd_binary: String,
    pub mpd_runtime_dir: std::path::PathBuf,
    pub started_at: Instant,
}
