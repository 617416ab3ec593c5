mod bluez;
mod config;
mod context;
mod control_api;
mod coordinator;
mod error;
mod event_bus;
mod keepalive;
mod mpd;
mod model;
mod mpris;
mod pulse;
mod store;

use std::sync::Mutex;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::coordinator::{exit_code, Coordinator};
use crate::error::CoreError;

/// Core orchestrator for a Bluetooth Classic A2DP speaker manager: pairing,
/// reconnection, idle-mode power management, and MPD/MPRIS integration.
#[derive(Parser)]
#[command(name = "btaudiod", about = "Bluetooth audio management daemon", version)]
struct Args {
    /// Override the adapter selection stored in settings.json for this run only.
    #[arg(long)]
    adapter: Option<String>,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let level = config::log_level_override().map(|l| l.as_filter()).unwrap_or("info");
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", format!("btaudiod={level}")) };
    }
    env_logger::Builder::from_default_env().format_timestamp_millis().init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start tokio runtime: {e}");
            return std::process::ExitCode::from(exit_code::FATAL_INIT as u8);
        }
    };

    let code = runtime.block_on(run(args));
    std::process::ExitCode::from(code as u8)
}

async fn run(args: Args) -> i32 {
    match run_inner(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal startup error: {e}");
            startup_exit_code(&e)
        }
    }
}

fn startup_exit_code(e: &CoreError) -> i32 {
    match e {
        CoreError::DbusUnavailable(_) => exit_code::DBUS_UNAVAILABLE,
        CoreError::PulseUnavailable(_) => exit_code::PULSE_UNAVAILABLE,
        _ => exit_code::FATAL_INIT,
    }
}

/// Runs startup steps 1-6 of spec §4.10 (load store, connect the system bus,
/// resolve the adapter, register the pairing agent and MPRIS player, connect
/// PulseAudio), hands off to [`Coordinator::start`] for steps 7-11, then
/// blocks until shutdown is requested.
async fn run_inner(args: Args) -> Result<i32, CoreError> {
    // Step 1: load the store.
    let event_bus = event_bus::EventBus::new();
    let store = store::Store::load(config::paired_devices_path(), config::settings_path())
        .await?
        .with_event_bus(event_bus.clone());

    // Step 2: connect to the system bus.
    let bus = zbus::Connection::system()
        .await
        .map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;
    let session = bluer::Session::new().await.map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;

    // Step 3: resolve the adapter. A CLI override wins for this run only;
    // the persisted selection is untouched.
    let settings = store.get_settings().await;
    let selected_adapter = args.adapter.unwrap_or(settings.selected_adapter);
    let adapter = bluez::adapter::resolve_adapter(&session, &selected_adapter).await?;
    if !adapter.is_powered().await.unwrap_or(false) {
        return Err(CoreError::AdapterNotPowered);
    }

    // Step 4: register the pairing agent.
    let agent = bluez::PairingAgent::register(&session).await?;

    // Step 5: register the MPRIS player before any device can connect.
    let (mpris_tx, mpris_rx) = mpsc::unbounded_channel();
    mpris::register(&bus, mpris_tx).await.map_err(|e| CoreError::DbusUnavailable(e.to_string()))?;

    // Step 6: connect to PulseAudio.
    let pulse = pulse::PulseClient::connect(config::pulse_server_candidates())
        .await
        .map_err(|e| CoreError::PulseUnavailable(e.to_string()))?;

    let ctx = Context {
        store,
        event_bus,
        bus,
        session,
        adapter,
        agent,
        pulse,
        mpris_commands: Mutex::new(Some(mpris_rx)),
        mpd_binary: std::env::var("MPD_BINARY").unwrap_or_else(|_| "mpd".to_string()),
        mpd_runtime_dir: config::mpd_runtime_dir(),
        started_at: std::time::Instant::now(),
    };

    let (coordinator, mut exit_rx) = Coordinator::start(ctx).await?;
    // An external transport (socket, D-Bus service, etc.) would take this
    // and drive Command/Subscription traffic against it; none is wired up
    // at this layer per spec §6 ("transport of the API is external to the core").
    let _control_api = control_api::ControlApi::new(coordinator.clone());

    info!("btaudiod started");

    let code = tokio::select! {
        code = exit_rx.recv() => code.unwrap_or(exit_code::NORMAL),
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            exit_code::NORMAL
        }
    };

    coordinator.shutdown().await;
    if code == exit_code::RESTART_REQUIRED {
        warn!("adapter switch requires a process restart");
    }
    Ok(code)
}
