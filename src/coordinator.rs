//! The device lifecycle coordinator (spec §4.10): owns all runtime device
//! state, serializes operations per device, runs the sink poller and
//! idle-mode engine, and drives adapter switches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::warn;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bluez::device::DeviceProperty;
use crate::bluez::DeviceEvent;
use crate::context::Context;
use crate::error::CoreError;
use crate::event_bus::{AvrcpEvent, Event};
use crate::keepalive::{KeepAlive, KeepAlivePlayer};
use crate::model::{
    AudioProfile, DeviceAddress, DeviceLifecycleState, IdleMode, PersistedDevice, RuntimeDevice, SinkState,
};
use crate::mpd::{self, MpdSupervisor, TransportCommand};
use crate::mpris::{MprisCommand, MprisCommandKind};
use crate::pulse::{self, PulseClient};
use crate::reconnect::{ReconnectConfig, ReconnectController, ReconnectDue};

mod idle;
pub use idle::{IdleAction, IdleState};

const SINK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_FOR_SERVICES: Duration = Duration::from_secs(10);
const WAIT_FOR_SINK: Duration = Duration::from_secs(30);
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);
const AVRCP_RETRY_ATTEMPTS: u32 = 3;
const AVRCP_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Distinguished exit codes the surrounding process supervisor interprets
/// (spec §6).
pub mod exit_code {
    pub const NORMAL: i32 = 0;
    pub const RESTART_REQUIRED: i32 = 64;
    pub const FATAL_INIT: i32 = 70;
    pub const DBUS_UNAVAILABLE: i32 = 71;
    pub const PULSE_UNAVAILABLE: i32 = 72;
}

/// Owns `runtime`, per-device locks, lifecycle state, pending timers,
/// keep-alives, and MPD supervisors for every managed device (spec §4.10).
pub struct Coordinator {
    ctx: Arc<Context>,
    runtime: RwLock<HashMap<DeviceAddress, RuntimeDevice>>,
    locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
    lifecycle: Mutex<HashMap<DeviceAddress, DeviceLifecycleState>>,
    suppress_reconnect: Mutex<HashSet<DeviceAddress>>,
    pending_suspend: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    pending_auto_disconnect: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    keepalives: Mutex<HashMap<DeviceAddress, KeepAlive>>,
    mpd: Mutex<HashMap<DeviceAddress, MpdSupervisor>>,
    event_watchers: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    idle_states: Mutex<HashMap<DeviceAddress, IdleState>>,
    reconnect: ReconnectController,
    shutdown: CancellationToken,
    exit_tx: mpsc::Sender<i32>,
    last_snapshot_hash: Mutex<Option<u64>>,
}

impl Coordinator {
    /// Runs startup steps 7-11 of spec §4.10 (steps 1-6 — load store, connect
    /// the bus, resolve the adapter, register the agent and MPRIS player,
    /// connect PulseAudio — happen while building the [`Context`] passed in
    /// here). Spawns the sink poller, the reconnect-due handler, and the
    /// MPRIS command forwarder.
    pub async fn start(ctx: Context) -> Result<(Arc<Self>, mpsc::Receiver<i32>), CoreError> {
        let ctx = Arc::new(ctx);
        let (reconnect, due_rx) = ReconnectController::new(ctx.event_bus.clone());
        let (exit_tx, exit_rx) = mpsc::channel(1);

        let coordinator = Arc::new(Self {
            ctx: ctx.clone(),
            runtime: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
            suppress_reconnect: Mutex::new(HashSet::new()),
            pending_suspend: Mutex::new(HashMap::new()),
            pending_auto_disconnect: Mutex::new(HashMap::new()),
            keepalives: Mutex::new(HashMap::new()),
            mpd: Mutex::new(HashMap::new()),
            event_watchers: Mutex::new(HashMap::new()),
            idle_states: Mutex::new(HashMap::new()),
            reconnect,
            shutdown: CancellationToken::new(),
            exit_tx,
            last_snapshot_hash: Mutex::new(None),
        });

        // Step 7: construct RuntimeDevice entries; purge stale BlueZ-cached
        // devices not in our store and not currently connected.
        let persisted = ctx.store.devices().await;
        let known: HashSet<DeviceAddress> = persisted.iter().map(|d| d.address.clone()).collect();
        {
            let mut runtime = coordinator.runtime.write().await;
            for device in &persisted {
                runtime.insert(device.address.clone(), RuntimeDevice::from_persisted(device.clone()));
            }
        }

        let bluez_addrs = ctx.adapter.device_addresses().await.unwrap_or_default();
        for addr in &bluez_addrs {
            if known.contains(addr) {
                continue;
            }
            if let Ok(device) = ctx.adapter.device(addr).await
                && !device.is_connected().await.unwrap_or(false)
            {
                let _ = ctx.adapter.remove_device(addr).await;
            }
        }

        // Step 8: adopt already-connected unmanaged devices.
        for addr in &bluez_addrs {
            if known.contains(addr) {
                continue;
            }
            if let Ok(device) = ctx.adapter.device(addr).await
                && device.is_connected().await.unwrap_or(false)
            {
                let name = device.name().await.unwrap_or(None).unwrap_or_else(|| addr.to_string());
                let new_device = PersistedDevice::new_default(addr.clone(), name);
                if ctx.store.upsert_device(new_device.clone()).await.is_ok() {
                    let mut runtime_device = RuntimeDevice::from_persisted(new_device);
                    runtime_device.connected = true;
                    runtime_device.present_in_bluez = true;
                    coordinator.runtime.write().await.insert(addr.clone(), runtime_device);
                }
            }
        }

        // Step 9: sink poller.
        coordinator.clone().spawn_sink_poller();

        // Step 10: reconnect handler + bootstrap.
        coordinator.clone().spawn_reconnect_handler(due_rx);
        let auto_connect_addrs: Vec<DeviceAddress> = coordinator
            .runtime
            .read()
            .await
            .values()
            .filter(|d| d.persisted.auto_connect && !d.connected)
            .map(|d| d.address().clone())
            .collect();
        coordinator.reconnect.bootstrap(auto_connect_addrs).await;

        // Step 11: already-connected devices get idle-mode, a watcher, and MPD.
        let connected_addrs: Vec<DeviceAddress> = coordinator
            .runtime
            .read()
            .await
            .values()
            .filter(|d| d.connected)
            .map(|d| d.address().clone())
            .collect();
        for addr in connected_addrs {
            coordinator.idle_states.lock().await.insert(addr.clone(), IdleState::Playing);
            coordinator.clone().spawn_device_watcher(addr.clone()).await;
            let mpd_enabled = coordinator.runtime.read().await.get(&addr).map(|d| d.persisted.mpd_enabled).unwrap_or(false);
            if mpd_enabled {
                coordinator.clone().start_mpd_for(&addr).await;
            }
        }

        coordinator.clone().spawn_mpris_forwarder();
        coordinator.clone().spawn_pulse_event_logger();
        coordinator.publish_snapshot().await;

        Ok((coordinator, exit_rx))
    }

    async fn lock_for(&self, address: &DeviceAddress) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(address.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn set_lifecycle(&self, address: &DeviceAddress, state: DeviceLifecycleState) {
        self.lifecycle.lock().await.insert(address.clone(), state);
    }

    /// Publishes `devices_changed` with the full runtime snapshot, but only
    /// if it differs from the previously published one (spec §8 property
    /// law 6).
    async fn publish_snapshot(&self) {
        let snapshot: Vec<RuntimeDevice> = self.runtime.read().await.values().cloned().collect();
        let Ok(bytes) = serde_json::to_vec(&snapshot) else { return };
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        bytes.hash(&mut hasher);
        let hash = hasher.finish();
        let mut last = self.last_snapshot_hash.lock().await;
        if *last == Some(hash) {
            return;
        }
        *last = Some(hash);
        self.ctx.event_bus.publish(Event::DevicesChanged(snapshot));
    }

    fn reconnect_config(settings: &crate::model::GlobalSettings) -> ReconnectConfig {
        ReconnectConfig {
            base_seconds: settings.reconnect_interval_seconds,
            max_backoff_seconds: settings.reconnect_max_backoff_seconds,
        }
    }

    // ---------------------------------------------------------------
    // Connect
    // ---------------------------------------------------------------

    /// Idempotent, serialized per device (spec §4.10 "Connect operation").
    pub async fn connect(self: &Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        self.reconnect.cancel(&address).await;
        self.suppress_reconnect.lock().await.remove(&address);
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        self.connect_locked(&address).await
    }

    async fn connect_locked(self: &Arc<Self>, address: &DeviceAddress) -> Result<(), CoreError> {
        self.set_lifecycle(address, DeviceLifecycleState::Connecting).await;
        if let Some(rt) = self.runtime.write().await.get_mut(address) {
            rt.transitioning = true;
        }

        let result = self.connect_inner(address).await;

        if let Err(ref e) = result {
            warn!("connect to {address} failed: {e}");
            self.teardown_partial_connect(address).await;
        }
        if let Some(rt) = self.runtime.write().await.get_mut(address) {
            rt.transitioning = false;
        }
        self.set_lifecycle(address, if result.is_ok() { DeviceLifecycleState::Connected } else { DeviceLifecycleState::Idle }).await;
        self.publish_snapshot().await;
        result
    }

    async fn connect_inner(self: &Arc<Self>, address: &DeviceAddress) -> Result<(), CoreError> {
        let device = self.ctx.adapter.device(address).await?;

        // Step 3: connect if not already connected, retrying once on Busy.
        if !device.is_connected().await.unwrap_or(false) {
            match device.connect().await {
                Ok(()) => {}
                Err(CoreError::Busy) => {
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                    device.connect().await?;
                }
                Err(e) => return Err(e),
            }
        }

        // Step 4: wait up to 10s for service interfaces.
        let deadline = tokio::time::Instant::now() + WAIT_FOR_SERVICES;
        while !device.has_media_transport(&self.ctx.bus, self.ctx.adapter.name()).await {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        // Step 5: AVRCP discovery, up to 3 retries at 2s; give up gracefully.
        let mut avrcp_available = false;
        for attempt in 0..AVRCP_RETRY_ATTEMPTS {
            if device.uuids().await.unwrap_or_default().iter().any(|u| u.eq_ignore_ascii_case("0000110e-0000-1000-8000-00805f9b34fb")) {
                avrcp_available = true;
                break;
            }
            if attempt + 1 < AVRCP_RETRY_ATTEMPTS {
                tokio::time::sleep(AVRCP_RETRY_INTERVAL).await;
            }
        }
        if !avrcp_available {
            warn!("no AVRCP interface for {address} after discovery retries, continuing without remote control");
        }

        // Step 6: activate the audio profile, fallback ladder (a)(b)(c).
        let persisted = self.ctx.store.get_device(address).await.unwrap_or_else(|| PersistedDevice::new_default(address.clone(), address.to_string()));
        self.activate_audio_profile(address, persisted.audio_profile).await?;

        // Step 7: wait up to 30s for the sink.
        let sink = self.ctx.pulse.wait_for_sink(address, WAIT_FOR_SINK).await?;

        // Step 8: apply idle-mode (starts in Playing since the sink just appeared).
        self.idle_states.lock().await.insert(address.clone(), IdleState::Playing);

        // Step 9: start MPD if enabled.
        if persisted.mpd_enabled {
            self.start_mpd_for(address).await;
        }

        // Step 10: mark connected, watch for BlueZ-observed disconnects.
        if let Some(rt) = self.runtime.write().await.get_mut(address) {
            rt.connected = true;
            rt.present_in_bluez = true;
            rt.paired_in_bluez = true;
            rt.sink_state = SinkState::Running;
            rt.last_connected_at = Some(chrono::Utc::now());
        } else {
            let mut rt = RuntimeDevice::from_persisted(persisted);
            rt.connected = true;
            rt.sink_state = SinkState::Running;
            self.runtime.write().await.insert(address.clone(), rt);
        }
        let _ = sink;
        self.clone().spawn_device_watcher(address.clone()).await;
        self.reconnect.on_attempt_succeeded(address).await;
        Ok(())
    }

    /// Fallback ladder: (a) direct profile set, (b) explicit
    /// `connect_profile(UUID)`, (c) a second direct profile-set pass after a
    /// short delay, tolerating a flaky first negotiation.
    async fn activate_audio_profile(&self, address: &DeviceAddress, profile: AudioProfile) -> Result<(), CoreError> {
        let names = pulse::known_profile_names_for(profile);
        let Some(card) = self.ctx.pulse.find_card_for(address).await? else {
            return Err(CoreError::AudioProfileFailed);
        };
        if self.ctx.pulse.set_card_profile(&card.name, names).await.is_ok() {
            return Ok(());
        }

        if profile == AudioProfile::A2dp
            && let Ok(device) = self.ctx.adapter.device(address).await
        {
            let _ = device.connect_profile("0000110d-0000-1000-8000-00805f9b34fb").await;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        self.ctx.pulse.set_card_profile(&card.name, names).await.map_err(|_| CoreError::AudioProfileFailed)
    }

    async fn teardown_partial_connect(&self, address: &DeviceAddress) {
        self.stop_keepalive(address).await;
        self.stop_mpd_for(address).await;
        self.cancel_pending_timers(address).await;
        self.stop_watcher(address).await;
        self.ctx.event_bus.publish(Event::Status(Some(format!("connect to {address} failed and was rolled back"))));
    }

    async fn start_mpd_for(self: &Arc<Self>, address: &DeviceAddress) {
        let Some(persisted) = self.ctx.store.get_device(address).await else { return };
        let in_use: Vec<u16> = self
            .ctx
            .store
            .devices()
            .await
            .iter()
            .filter(|d| &d.address != address)
            .filter_map(|d| d.mpd_port)
            .collect();
        let port = match mpd::allocate(&persisted, &in_use) {
            Ok(port) => port,
            Err(e) => {
                warn!("no free MPD port for {address}: {e}");
                return;
            }
        };
        let Ok(sinks) = self.ctx.pulse.bluetooth_sinks().await else { return };
        let Some(sink) = sinks.into_iter().find(|s| PulseClient::sink_name_matches(&s.name, address)) else {
            return;
        };
        let mut updated = persisted.clone();
        updated.mpd_port = Some(port);
        let _ = self.ctx.store.upsert_device(updated).await;

        match MpdSupervisor::start(
            self.ctx.mpd_binary.clone(),
            self.ctx.mpd_runtime_dir.clone(),
            address.clone(),
            port,
            sink.name,
            persisted.mpd_hw_volume_pct,
        )
        .await
        {
            Ok(supervisor) => {
                self.mpd.lock().await.insert(address.clone(), supervisor);
            }
            Err(e) => {
                warn!("MPD failed to start for {address}: {e}");
                self.ctx.event_bus.publish(Event::Status(Some(format!("MPD unavailable for {address}"))));
            }
        }
    }

    async fn stop_mpd_for(&self, address: &DeviceAddress) {
        if let Some(supervisor) = self.mpd.lock().await.remove(address) {
            supervisor.stop().await;
        }
    }

    async fn stop_keepalive(&self, address: &DeviceAddress) {
        if let Some(keepalive) = self.keepalives.lock().await.remove(address) {
            keepalive.stop().await;
        }
        if let Some(rt) = self.runtime.write().await.get_mut(address) {
            rt.keep_alive_active = false;
        }
    }

    async fn stop_watcher(&self, address: &DeviceAddress) {
        if let Some(handle) = self.event_watchers.lock().await.remove(address) {
            handle.abort();
        }
    }

    async fn cancel_pending_timers(&self, address: &DeviceAddress) {
        if let Some(handle) = self.pending_suspend.lock().await.remove(address) {
            handle.abort();
        }
        if let Some(handle) = self.pending_auto_disconnect.lock().await.remove(address) {
            handle.abort();
        }
    }

    /// Watches `org.bluez.Device1.Connected` for this device and treats a
    /// transition to `false` as a BlueZ-observed disconnect (spec §4.10).
    /// Superseded by a fresh watcher on every successful connect; stopped
    /// explicitly on user-initiated disconnect/forget.
    async fn spawn_device_watcher(self: Arc<Self>, address: DeviceAddress) {
        let coordinator = self.clone();
        let watch_address = address.clone();
        let handle = tokio::spawn(async move {
            let Ok(device) = coordinator.ctx.adapter.device(&watch_address).await else { return };
            let Ok(events) = device.events().await else { return };
            tokio::pin!(events);
            while let Some(DeviceEvent::PropertyChanged(prop)) = events.next().await {
                if let DeviceProperty::Connected(false) = prop {
                    coordinator.event_watchers.lock().await.remove(&watch_address);
                    coordinator.handle_unexpected_disconnect(watch_address.clone()).await;
                    return;
                }
            }
        });
        if let Some(previous) = self.event_watchers.lock().await.insert(address, handle) {
            previous.abort();
        }
    }

    // ---------------------------------------------------------------
    // Disconnect / Forget
    // ---------------------------------------------------------------

    /// User-initiated disconnect (spec §4.10): suppresses reconnection.
    pub async fn disconnect(self: &Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        self.suppress_reconnect.lock().await.insert(address.clone());
        self.reconnect.cancel(&address).await;
        self.set_lifecycle(&address, DeviceLifecycleState::Disconnecting).await;
        self.cancel_pending_timers(&address).await;
        self.stop_keepalive(&address).await;
        self.stop_mpd_for(&address).await;
        self.stop_watcher(&address).await;
        self.idle_states.lock().await.remove(&address);

        let result = match self.ctx.adapter.device(&address).await {
            Ok(device) => device.disconnect().await,
            Err(e) => Err(e),
        };
        if let Some(rt) = self.runtime.write().await.get_mut(&address) {
            rt.connected = false;
            rt.last_disconnected_at = Some(chrono::Utc::now());
        }
        self.set_lifecycle(&address, DeviceLifecycleState::Idle).await;
        self.publish_snapshot().await;
        result
    }

    /// Called when BlueZ reports a disconnect we did not request
    /// (spec §4.10 "BlueZ-observed (unexpected)").
    async fn handle_unexpected_disconnect(self: Arc<Self>, address: DeviceAddress) {
        if self.suppress_reconnect.lock().await.contains(&address) {
            return;
        }
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        self.cancel_pending_timers(&address).await;
        self.stop_keepalive(&address).await;
        self.stop_mpd_for(&address).await;
        self.idle_states.lock().await.remove(&address);
        if let Some(rt) = self.runtime.write().await.get_mut(&address) {
            rt.connected = false;
            rt.last_disconnected_at = Some(chrono::Utc::now());
        }
        self.publish_snapshot().await;

        let settings = self.ctx.store.get_settings().await;
        if settings.auto_reconnect {
            self.reconnect
                .on_unexpected_disconnect(address, Self::reconnect_config(&settings))
                .await;
        }
    }

    /// Ensures user-disconnect semantics, then removes the device from
    /// BlueZ and the store (spec §4.10 "Forget"). Safe on a discovered-only
    /// device.
    pub async fn forget(self: &Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        let _ = self.disconnect(address.clone()).await;
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        self.set_lifecycle(&address, DeviceLifecycleState::Forgetting).await;
        let _ = self.ctx.adapter.remove_device(&address).await;
        self.ctx.store.remove_device(&address).await?;
        self.runtime.write().await.remove(&address);
        self.suppress_reconnect.lock().await.remove(&address);
        self.lifecycle.lock().await.remove(&address);
        self.publish_snapshot().await;
        Ok(())
    }

    pub async fn pair(&self, address: DeviceAddress) -> Result<(), CoreError> {
        let device = self.ctx.adapter.device(&address).await?;
        device.pair().await?;
        device.set_trusted(true).await?;
        if self.ctx.store.get_device(&address).await.is_none() {
            let name = device.name().await.unwrap_or(None).unwrap_or_else(|| address.to_string());
            self.ctx.store.upsert_device(PersistedDevice::new_default(address, name)).await?;
        }
        Ok(())
    }

    pub async fn update_device_settings(&self, address: DeviceAddress, patch: &crate::model::DevicePatch) -> Result<PersistedDevice, CoreError> {
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        let updated = self.ctx.store.update_device(&address, patch).await?;
        if let Some(rt) = self.runtime.write().await.get_mut(&address) {
            rt.persisted = updated.clone();
        }
        self.publish_snapshot().await;
        Ok(updated)
    }

    pub async fn snapshot(&self) -> Vec<RuntimeDevice> {
        self.runtime.read().await.values().cloned().collect()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Disconnect-then-connect under a single hold of the device lock
    /// (spec §4.11 `force-reconnect`), rather than two separately-locked
    /// calls that would let another operation interleave between them.
    pub async fn force_reconnect(self: &Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        self.reconnect.cancel(&address).await;
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;

        self.suppress_reconnect.lock().await.remove(&address);
        self.cancel_pending_timers(&address).await;
        self.stop_keepalive(&address).await;
        self.stop_mpd_for(&address).await;
        self.stop_watcher(&address).await;
        self.idle_states.lock().await.remove(&address);
        if let Ok(device) = self.ctx.adapter.device(&address).await {
            let _ = device.disconnect().await;
        }
        if let Some(rt) = self.runtime.write().await.get_mut(&address) {
            rt.connected = false;
            rt.last_disconnected_at = Some(chrono::Utc::now());
        }
        self.publish_snapshot().await;

        self.connect_locked(&address).await
    }

    // ---------------------------------------------------------------
    // Sink poller + idle-mode engine
    // ---------------------------------------------------------------

    fn spawn_sink_poller(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(SINK_POLL_INTERVAL) => {}
                }
                self.poll_sinks_once().await;
            }
        });
    }

    async fn poll_sinks_once(self: &Arc<Self>) {
        let Ok(sinks) = self.ctx.pulse.bluetooth_sinks().await else { return };
        let addresses: Vec<DeviceAddress> = self.runtime.read().await.keys().cloned().collect();

        for address in addresses {
            let matched = sinks.iter().find(|s| PulseClient::sink_name_matches(&s.name, &address));
            let new_state = match matched {
                Some(sink) => match sink.state {
                    pulse::SinkState::Running => SinkState::Running,
                    pulse::SinkState::Idle => SinkState::Idle,
                    pulse::SinkState::Suspended => SinkState::Suspended,
                },
                None => SinkState::Absent,
            };

            let (was_connected, previous_state) = {
                let runtime = self.runtime.read().await;
                match runtime.get(&address) {
                    Some(rt) => (rt.connected, rt.sink_state),
                    None => continue,
                }
            };
            if !was_connected || previous_state == new_state {
                continue;
            }

            if let Some(rt) = self.runtime.write().await.get_mut(&address) {
                rt.sink_state = new_state;
            }

            match (previous_state, new_state) {
                (SinkState::Idle, SinkState::Running) | (SinkState::Suspended, SinkState::Running) => {
                    self.apply_idle_actions(&address, idle::on_sink_went_running()).await;
                }
                (SinkState::Running, SinkState::Idle) => {
                    if let Some((mode, power_save_delay_s, auto_disconnect_minutes)) = self.device_idle_config(&address).await {
                        let outcome = idle::on_sink_went_idle(mode, power_save_delay_s, auto_disconnect_minutes);
                        self.apply_idle_actions(&address, outcome).await;
                    }
                }
                (SinkState::Running, SinkState::Absent) | (SinkState::Idle, SinkState::Absent) => {
                    self.clone().handle_unexpected_disconnect(address.clone()).await;
                }
                _ => {}
            }
        }

        self.publish_snapshot().await;
    }

    async fn device_idle_config(&self, address: &DeviceAddress) -> Option<(IdleMode, u32, u32)> {
        let runtime = self.runtime.read().await;
        let rt = runtime.get(address)?;
        Some((rt.persisted.idle_mode, rt.persisted.power_save_delay_s, rt.persisted.auto_disconnect_minutes))
    }

    async fn apply_idle_actions(self: &Arc<Self>, address: &DeviceAddress, (state, actions): (IdleState, Vec<IdleAction>)) {
        self.idle_states.lock().await.insert(address.clone(), state);
        for action in actions {
            match action {
                IdleAction::CancelSuspendTimer => {
                    if let Some(h) = self.pending_suspend.lock().await.remove(address) {
                        h.abort();
                    }
                }
                IdleAction::CancelAutoDisconnectTimer => {
                    if let Some(h) = self.pending_auto_disconnect.lock().await.remove(address) {
                        h.abort();
                    }
                }
                IdleAction::StopKeepAlive => self.stop_keepalive(address).await,
                IdleAction::StartKeepAlive => self.start_keepalive(address).await,
                IdleAction::StartSuspendTimer(delay) => self.clone().start_suspend_timer(address.clone(), delay).await,
                IdleAction::StartAutoDisconnectTimer(delay) => self.clone().start_auto_disconnect_timer(address.clone(), delay).await,
                IdleAction::SuspendSink => self.suspend_device_sink(address).await,
            }
        }
    }

    async fn start_keepalive(self: &Arc<Self>, address: &DeviceAddress) {
        let Ok(sinks) = self.ctx.pulse.bluetooth_sinks().await else { return };
        let Some(sink) = sinks.into_iter().find(|s| PulseClient::sink_name_matches(&s.name, address)) else { return };
        let method = self.runtime.read().await.get(address).map(|d| d.persisted.keep_alive_method).unwrap_or(crate::model::KeepAliveMethod::Silence);
        let keepalive = KeepAlive::start(sink.name, method, KeepAlivePlayer::default());
        self.keepalives.lock().await.insert(address.clone(), keepalive);
        if let Some(rt) = self.runtime.write().await.get_mut(address) {
            rt.keep_alive_active = true;
        }
    }

    async fn suspend_device_sink(&self, address: &DeviceAddress) {
        if let Ok(sinks) = self.ctx.pulse.bluetooth_sinks().await
            && let Some(sink) = sinks.into_iter().find(|s| PulseClient::sink_name_matches(&s.name, address))
        {
            let _ = self.ctx.pulse.suspend_sink(&sink.name).await;
        }
    }

    /// Schedules a power-save suspend timer, stored so a later "sink went
    /// running" or "user disconnect" can cancel it (spec §4.10 idle-mode
    /// table).
    async fn start_suspend_timer(self: Arc<Self>, address: DeviceAddress, delay: Duration) {
        let coordinator = self.clone();
        let timer_address = address.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.pending_suspend.lock().await.remove(&timer_address);
            coordinator.apply_idle_actions(&timer_address, idle::on_power_save_timer_fired()).await;
        });
        self.pending_suspend.lock().await.insert(address, handle);
    }

    /// Schedules an auto-disconnect timer. Firing disconnects the device but
    /// does not suppress reconnection (spec §4.10 idle-mode table).
    async fn start_auto_disconnect_timer(self: Arc<Self>, address: DeviceAddress, delay: Duration) {
        let coordinator = self.clone();
        let timer_address = address.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.pending_auto_disconnect.lock().await.remove(&timer_address);
            let _ = coordinator.disconnect_without_suppression(timer_address).await;
        });
        self.pending_auto_disconnect.lock().await.insert(address, handle);
    }

    async fn disconnect_without_suppression(self: Arc<Self>, address: DeviceAddress) -> Result<(), CoreError> {
        let lock = self.lock_for(&address).await;
        let _guard = lock.lock().await;
        self.cancel_pending_timers(&address).await;
        self.stop_keepalive(&address).await;
        self.stop_mpd_for(&address).await;
        self.stop_watcher(&address).await;
        self.idle_states.lock().await.remove(&address);
        let result = match self.ctx.adapter.device(&address).await {
            Ok(device) => device.disconnect().await,
            Err(e) => Err(e),
        };
        if let Some(rt) = self.runtime.write().await.get_mut(&address) {
            rt.connected = false;
            rt.last_disconnected_at = Some(chrono::Utc::now());
        }
        self.publish_snapshot().await;
        result
    }

    // ---------------------------------------------------------------
    // Reconnect-due handling
    // ---------------------------------------------------------------

    fn spawn_reconnect_handler(self: Arc<Self>, mut due_rx: mpsc::UnboundedReceiver<ReconnectDue>) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let due = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    due = due_rx.recv() => match due {
                        Some(due) => due,
                        None => return,
                    },
                };
                self.clone().handle_reconnect_due(due).await;
            }
        });
    }

    async fn handle_reconnect_due(self: Arc<Self>, due: ReconnectDue) {
        let settings = self.ctx.store.get_settings().await;
        let persisted = self.ctx.store.get_device(&due.address).await;
        let suppressed = self.suppress_reconnect.lock().await.contains(&due.address);

        let eligible = settings.auto_reconnect && persisted.as_ref().is_some_and(|d| d.auto_connect) && !suppressed;

        if !eligible {
            self.reconnect.cancel(&due.address).await;
            return;
        }

        if self.connect(due.address.clone()).await.is_err() {
            let settings = self.ctx.store.get_settings().await;
            self.reconnect.on_attempt_failed(due.address, due.attempt, Self::reconnect_config(&settings)).await;
        }
    }

    // ---------------------------------------------------------------
    // AVRCP / MPRIS command forwarding
    // ---------------------------------------------------------------

    fn spawn_mpris_forwarder(self: Arc<Self>) {
        let Some(mut rx) = self.ctx.mpris_commands.lock().unwrap().take() else { return };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    command = rx.recv() => match command {
                        Some(c) => c,
                        None => return,
                    },
                };
                self.handle_mpris_command(command).await;
            }
        });
    }

    async fn handle_mpris_command(&self, command: MprisCommand) {
        let transport = match command.command {
            MprisCommandKind::Play => Some(TransportCommand::Play),
            MprisCommandKind::Pause => Some(TransportCommand::Pause),
            MprisCommandKind::Next => Some(TransportCommand::Next),
            MprisCommandKind::Previous => Some(TransportCommand::Previous),
            _ => None,
        };
        if let Some(transport) = transport {
            let mpd = self.mpd.lock().await;
            for supervisor in mpd.values() {
                supervisor.send(transport).await;
            }
        }
        if let Some(address) = command.address_hint {
            self.ctx.event_bus.publish(Event::Avrcp(AvrcpEvent {
                address,
                property: "transport".to_string(),
                value: format!("{:?}", command.command),
            }));
        }
    }

    // ---------------------------------------------------------------
    // PulseAudio sink-event subscription
    // ---------------------------------------------------------------

    /// Drains the sink add/remove/state/volume/mute subscription (spec
    /// §4.6). The sink poller (`poll_sinks_once`) remains the sole driver
    /// of idle-mode transitions — a stable 5s sampling cadence avoids
    /// flapping on transient volume/mute notifications — so this task only
    /// keeps the subscription channel drained and its traffic visible in
    /// the logs.
    fn spawn_pulse_event_logger(self: Arc<Self>) {
        let Some(mut rx) = self.ctx.pulse.take_events() else { return };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(e) => e,
                        None => return,
                    },
                };
                log::debug!("pulse sink event: {event:?}");
            }
        });
    }

    // ---------------------------------------------------------------
    // Adapter switch
    // ---------------------------------------------------------------

    /// Two-phase adapter switch (spec §4.10): disconnects (and optionally
    /// forgets) every connected device, persists the new adapter selection,
    /// then signals the process to exit with the "restart required" code.
    /// Never attempts live re-binding of the adapter.
    pub async fn switch_adapter(self: &Arc<Self>, new_adapter: String, clean: bool) -> Result<(), CoreError> {
        let connected: Vec<DeviceAddress> = self.runtime.read().await.values().filter(|d| d.connected).map(|d| d.address().clone()).collect();
        for address in connected {
            let _ = self.disconnect(address.clone()).await;
            if clean {
                let _ = self.forget(address).await;
            }
        }

        let patch = crate::model::SettingsPatch { selected_adapter: Some(new_adapter.clone()), ..Default::default() };
        self.ctx.store.put_settings(&patch).await?;

        self.ctx.event_bus.publish(Event::AdapterSwitchRequired { new_adapter });
        self.ctx.event_bus.publish(Event::Status(Some("restart required".to_string())));
        let _ = self.exit_tx.send(exit_code::RESTART_REQUIRED).await;
        Ok(())
    }

    /// Requests a graceful shutdown with the given exit code (spec §4.11
    /// `restart`, or normal termination).
    pub async fn request_shutdown(&self, code: i32) {
        let _ = self.exit_tx.send(code).await;
    }

    /// Cancels every background task, giving in-flight work a 3s grace
    /// period before the process exits (spec §5).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }
}
