//! In-process command/event interface translating external requests into
//! coordinator calls (spec §4.11). Grounded in the teacher's `ipc.rs`
//! length-prefixed-frame server: same command-in/event-stream-out shape, but
//! transport-agnostic here — whatever process embeds [`ControlApi`] owns the
//! wire format.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::Context;
use crate::coordinator::Coordinator;
use crate::error::CoreError;
use crate::event_bus::{Event, ReplayRequest, Subscription};
use crate::model::{DeviceAddress, DevicePatch, GlobalSettings, PersistedDevice, RuntimeDevice, SettingsPatch};

#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    pub name: String,
    pub address: Option<DeviceAddress>,
    pub powered: bool,
}

/// One request into the coordinator (spec §4.11 command table).
#[derive(Debug, Clone)]
pub enum Command {
    ListDevices,
    ListAdapters,
    SetAdapter { address: String, clean: bool },
    StartScan,
    ScanStatus,
    Pair { address: DeviceAddress },
    Connect { address: DeviceAddress },
    Disconnect { address: DeviceAddress },
    Forget { address: DeviceAddress },
    ForceReconnect { address: DeviceAddress },
    UpdateDeviceSettings { address: DeviceAddress, patch: DevicePatch },
    GetSettings,
    PutSettings { patch: SettingsPatch },
    Restart,
}

/// Either an acknowledgement with no payload, a command-specific payload, or
/// a structured error (spec §4.11: "each returns either an acknowledgement
/// ... or a structured error").
#[derive(Debug, Clone)]
pub enum CommandResult {
    Ack,
    RestartRequired,
    Devices(Vec<RuntimeDevice>),
    Adapters(Vec<AdapterDescriptor>),
    ScanStarted { duration_s: u32 },
    ScanStatus { scanning: bool, seconds_remaining: Option<u32> },
    Device(Box<PersistedDevice>),
    Settings(GlobalSettings),
    Error(CoreError),
}

struct ScanState {
    started_at: Instant,
    duration_s: u32,
    handle: JoinHandle<()>,
}

/// Translates [`Command`]s into [`Coordinator`] calls and exposes
/// subscription attach (spec §4.11).
pub struct ControlApi {
    coordinator: Arc<Coordinator>,
    ctx: Arc<Context>,
    scan: Mutex<Option<ScanState>>,
}

impl ControlApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let ctx = coordinator.context().clone();
        Self { coordinator, ctx, scan: Mutex::new(None) }
    }

    /// Attaches a new subscriber to the event bus, optionally replaying
    /// ring-buffer history first (spec §4.11 "subscription channel").
    pub fn subscribe(&self, replay: ReplayRequest) -> Subscription {
        self.ctx.event_bus.subscribe(replay)
    }

    pub async fn dispatch(&self, command: Command) -> CommandResult {
        match self.dispatch_inner(command).await {
            Ok(result) => result,
            Err(e) => CommandResult::Error(e),
        }
    }

    async fn dispatch_inner(&self, command: Command) -> Result<CommandResult, CoreError> {
        match command {
            Command::ListDevices => Ok(CommandResult::Devices(self.coordinator.snapshot().await)),
            Command::ListAdapters => Ok(CommandResult::Adapters(self.list_adapters().await?)),
            Command::SetAdapter { address, clean } => {
                self.coordinator.switch_adapter(address, clean).await?;
                Ok(CommandResult::RestartRequired)
            }
            Command::StartScan => Ok(CommandResult::ScanStarted { duration_s: self.start_scan().await? }),
            Command::ScanStatus => {
                let (scanning, seconds_remaining) = self.scan_status().await;
                Ok(CommandResult::ScanStatus { scanning, seconds_remaining })
            }
            Command::Pair { address } => {
                self.coordinator.pair(address).await?;
                Ok(CommandResult::Ack)
            }
            Command::Connect { address } => {
                self.coordinator.connect(address).await?;
                Ok(CommandResult::Ack)
            }
            Command::Disconnect { address } => {
                self.coordinator.disconnect(address).await?;
                Ok(CommandResult::Ack)
            }
            Command::Forget { address } => {
                self.coordinator.forget(address).await?;
                Ok(CommandResult::Ack)
            }
            Command::ForceReconnect { address } => {
                self.coordinator.force_reconnect(address).await?;
                Ok(CommandResult::Ack)
            }
            Command::UpdateDeviceSettings { address, patch } => {
                let updated = self.coordinator.update_device_settings(address, &patch).await?;
                Ok(CommandResult::Device(Box::new(updated)))
            }
            Command::GetSettings => Ok(CommandResult::Settings(self.ctx.store.get_settings().await)),
            Command::PutSettings { patch } => {
                let settings = self.ctx.store.put_settings(&patch).await?;
                Ok(CommandResult::Settings(settings))
            }
            Command::Restart => {
                self.coordinator.request_shutdown(crate::coordinator::exit_code::NORMAL).await;
                Ok(CommandResult::Ack)
            }
        }
    }

    async fn list_adapters(&self) -> Result<Vec<AdapterDescriptor>, CoreError> {
        let names = self
            .ctx
            .session
            .adapter_names()
            .await
            .map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let adapter = self.ctx.session.adapter(&name).map_err(CoreError::from)?;
            let address = adapter
                .address()
                .await
                .ok()
                .and_then(|addr| DeviceAddress::parse(&addr.to_string()).ok());
            let powered = adapter.is_powered().await.unwrap_or(false);
            out.push(AdapterDescriptor { name, address, powered });
        }
        Ok(out)
    }

    /// Starts discovery for `scan_duration_seconds` (spec §4.11
    /// `start-scan`); a previous in-flight scan is cancelled first.
    async fn start_scan(&self) -> Result<u32, CoreError> {
        let duration_s = self.ctx.store.get_settings().await.scan_duration_seconds;
        let stream = self.ctx.adapter.start_discovery().await?;

        let mut scan = self.scan.lock().await;
        if let Some(previous) = scan.take() {
            previous.handle.abort();
        }

        let event_bus = self.ctx.event_bus.clone();
        let adapter_name = self.ctx.adapter.name().to_string();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            let sleep = tokio::time::sleep(Duration::from_secs(duration_s as u64));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    next = stream.next() => if next.is_none() { break },
                }
            }
            log::info!("scan window on {adapter_name} closed");
            event_bus.publish(Event::ScanFinished { error: None });
        });

        *scan = Some(ScanState { started_at: Instant::now(), duration_s, handle });
        self.ctx.event_bus.publish(Event::ScanStarted { duration_s });
        Ok(duration_s)
    }

    async fn scan_status(&self) -> (bool, Option<u32>) {
        let scan = self.scan.lock().await;
        match scan.as_ref() {
            Some(state) => {
                let elapsed = state.started_at.elapsed().as_secs() as u32;
                if elapsed >= state.duration_s {
                    (false, None)
                } else {
                    (true, Some(state.duration_s - elapsed))
                }
            }
            None => (false, None),
        }
    }
}
