//! Per-device MPD supervisor (spec §4.8): allocates a port, writes a config
//! file pointing at the device's PulseAudio sink, spawns the daemon,
//! connects a control client, and restarts the daemon on crash.

pub mod client;
pub mod port;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{error, warn};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::model::DeviceAddress;

pub use client::MpdClient;
pub use port::allocate;

const RESTART_LIMIT: u32 = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Transport commands routed from an AVRCP callback to the connected MPD
/// client (spec §4.8: "routes subsequent transport commands ... when the
/// device's AVRCP callback fires").
#[derive(Debug, Clone, Copy)]
pub enum TransportCommand {
    Play,
    Pause,
    Next,
    Previous,
}

/// Owns the spawned `mpd`-style daemon and its control connection for one
/// device. Dropped without calling [`MpdSupervisor::stop`], the supervisor
/// task is aborted and the child process is left to exit on its own EOF.
pub struct MpdSupervisor {
    address: DeviceAddress,
    port: u16,
    config_path: PathBuf,
    command_tx: mpsc::Sender<TransportCommand>,
    supervisor_task: JoinHandle<()>,
}

impl MpdSupervisor {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Starts the daemon for `address` on `port`, writing its config to
    /// `<mpd_runtime_dir>/<address>/mpd.conf` pointing `audio_output` at
    /// `sink_name`. Applies `hw_volume_pct` once, immediately after the
    /// first successful connect (spec §4.8).
    pub async fn start(
        mpd_binary: String,
        mpd_runtime_dir: PathBuf,
        address: DeviceAddress,
        port: u16,
        sink_name: String,
        hw_volume_pct: u8,
    ) -> Result<Self, CoreError> {
        let device_dir = mpd_runtime_dir.join(address.path_form());
        tokio::fs::create_dir_all(&device_dir).await?;
        let config_path = device_dir.join("mpd.conf");
        let db_path = device_dir.join("db");
        let log_path = device_dir.join("mpd.log");
        let pid_path = device_dir.join("mpd.pid");
        let state_path = device_dir.join("state");

        let config = render_config(&db_path, &log_path, &pid_path, &state_path, port, &sink_name);
        tokio::fs::write(&config_path, config).await?;

        let mut process = spawn_daemon(&mpd_binary, &config_path).await?;
        let client = wait_for_control_port(port).await?;
        drop(client); // first connect only establishes reachability

        let mut client = MpdClient::connect(port).await?;
        if let Err(e) = client.set_volume(hw_volume_pct).await {
            warn!("initial MPD volume set failed for {address}: {e}");
        }
        drop(client);

        let (command_tx, command_rx) = mpsc::channel(16);
        let supervisor_task = tokio::spawn(supervise(
            address.clone(),
            mpd_binary,
            config_path.clone(),
            port,
            process.child.take().expect("freshly spawned"),
            command_rx,
        ));

        Ok(Self {
            address,
            port,
            config_path,
            command_tx,
            supervisor_task,
        })
    }

    pub async fn send(&self, command: TransportCommand) {
        let _ = self.command_tx.send(command).await;
    }

    /// Gracefully shuts the daemon and removes transient files (spec §4.8).
    pub async fn stop(self) {
        self.supervisor_task.abort();
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            if let Ok(mut client) = MpdClient::connect(self.port).await {
                client.close().await;
            }
        })
        .await;
        if let Some(parent) = self.config_path.parent() {
            let _ = tokio::fs::remove_dir_all(parent).await;
        }
    }
}

struct SpawnedDaemon {
    child: Option<Child>,
}

async fn spawn_daemon(mpd_binary: &str, config_path: &std::path::Path) -> Result<SpawnedDaemon, CoreError> {
    let child = Command::new(mpd_binary)
        .arg("--no-daemon")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(SpawnedDaemon { child: Some(child) })
}

async fn wait_for_control_port(port: u16) -> Result<MpdClient, CoreError> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match MpdClient::connect(port).await {
            Ok(client) => return Ok(client),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

/// Watches the child process; restarts it up to [`RESTART_LIMIT`] times
/// within [`RESTART_WINDOW`], then gives up — the device stays connected,
/// `MpdFailed` is surfaced as a degrade rather than a disconnect (spec §4.8,
/// §7's "degrade" policy).
async fn supervise(
    address: DeviceAddress,
    mpd_binary: String,
    config_path: PathBuf,
    port: u16,
    mut child: Child,
    mut command_rx: mpsc::Receiver<TransportCommand>,
) {
    let mut restarts: Vec<Instant> = Vec::new();
    let client = Mutex::new(None::<MpdClient>);

    loop {
        tokio::select! {
            exit = child.wait() => {
                match exit {
                    Ok(status) if status.success() => return,
                    _ => {}
                }
                let now = Instant::now();
                restarts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
                if restarts.len() as u32 >= RESTART_LIMIT {
                    error!("MPD for {address} crashed {} times in {:?}, giving up: {}", restarts.len(), RESTART_WINDOW, CoreError::MpdFailed);
                    return;
                }
                restarts.push(now);
                warn!("MPD for {address} exited unexpectedly, restarting");
                match spawn_daemon(&mpd_binary, &config_path).await {
                    Ok(mut spawned) => child = spawned.child.take().expect("freshly spawned"),
                    Err(e) => {
                        error!("failed to restart MPD for {address}: {e}");
                        return;
                    }
                }
            }
            Some(cmd) = command_rx.recv() => {
                let mut guard = client.lock().await;
                if guard.is_none() {
                    *guard = MpdClient::connect(port).await.ok();
                }
                if let Some(c) = guard.as_mut() {
                    let result = match cmd {
                        TransportCommand::Play => c.play().await,
                        TransportCommand::Pause => c.pause().await,
                        TransportCommand::Next => c.next().await,
                        TransportCommand::Previous => c.previous().await,
                    };
                    if result.is_err() {
                        *guard = None;
                    }
                }
            }
            else => return,
        }
    }
}

fn render_config(
    db_path: &std::path::Path,
    log_path: &std::path::Path,
    pid_path: &std::path::Path,
    state_path: &std::path::Path,
    port: u16,
    sink_name: &str,
) -> String {
    format!(
        "db_file \"{}\"\n\
         log_file \"{}\"\n\
         pid_file \"{}\"\n\
         state_file \"{}\"\n\
         bind_to_address \"127.0.0.1\"\n\
         port \"{}\"\n\
         audio_output {{\n\
         \ttype \"pulse\"\n\
         \tname \"btaudiod\"\n\
         \tsink \"{}\"\n\
         }}\n",
        db_path.display(),
        log_path.display(),
        pid_path.display(),
        state_path.display(),
        port,
        sink_name,
    )
}
