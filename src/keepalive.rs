//! Per-device keep-alive loop (spec §4.7): periodically pipes a short burst
//! of near-silent audio to a sink so the speaker does not enter its own
//! standby.
//!
//! Grounded on `other_examples/.../maxdexh-scratchbar/pulse.rs`'s use of
//! `tokio::process::Command` to shell out to `pactl`; here the same idiom
//! drives a `pacat`-style player instead, fed generated PCM over stdin.

use std::process::Stdio;
use std::time::Duration;

use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::model::KeepAliveMethod;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const DEGRADED_INTERVAL: Duration = Duration::from_secs(30);
const BURST_SECONDS: u32 = 1;
const SAMPLE_RATE: u32 = 44_100;
const STOP_GRACE: Duration = Duration::from_secs(2);
const FAILURES_BEFORE_DEGRADE: u32 = 3;

/// The external player binary and arguments, templated with the sink name
/// (mirrors the teacher's `config.rs::run_template_cmd` templated-command
/// shape).
#[derive(Debug, Clone)]
pub struct KeepAlivePlayer {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for KeepAlivePlayer {
    fn default() -> Self {
        Self {
            program: "pacat".to_string(),
            args: vec!["--raw".into(), "--format=s16le".into(), "--rate=44100".into(), "--channels=1".into()],
        }
    }
}

/// Owns the background task for one device's keep-alive loop. Dropping this
/// without calling [`KeepAlive::stop`] aborts the task without waiting for
/// an in-flight process.
pub struct KeepAlive {
    handle: JoinHandle<()>,
    stop_tx: tokio::sync::oneshot::Sender<tokio::sync::oneshot::Sender<()>>,
}

impl KeepAlive {
    /// Starts waking every 5 s to pipe audio to `sink_name` via `method`.
    /// Three consecutive spawn/pipe failures demote the wake interval to 30s
    /// until one succeeds (spec §4.7).
    pub fn start(sink_name: String, method: KeepAliveMethod, player: KeepAlivePlayer) -> Self {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(run(sink_name, method, player, stop_rx));
        Self { handle, stop_tx }
    }

    /// Cancels the loop and waits up to 2 s for any in-flight process to
    /// exit (spec §4.7).
    pub async fn stop(self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.stop_tx.send(done_tx).is_err() {
            // task already exited on its own
            return;
        }
        let _ = timeout(STOP_GRACE, done_rx).await;
        let _ = timeout(STOP_GRACE, self.handle).await;
    }
}

async fn run(
    sink_name: String,
    method: KeepAliveMethod,
    player: KeepAlivePlayer,
    mut stop_rx: tokio::sync::oneshot::Receiver<tokio::sync::oneshot::Sender<()>>,
) {
    let pcm = generate_burst(method);
    let mut consecutive_failures: u32 = 0;
    let mut interval = TICK_INTERVAL;

    loop {
        tokio::select! {
            biased;
            done_tx = &mut stop_rx => {
                if let Ok(done_tx) = done_tx {
                    let _ = done_tx.send(());
                }
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match burst(&player, &sink_name, &pcm).await {
            Ok(()) => {
                consecutive_failures = 0;
                interval = TICK_INTERVAL;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!("keep-alive burst to {sink_name} failed: {e}");
                if consecutive_failures >= FAILURES_BEFORE_DEGRADE {
                    interval = DEGRADED_INTERVAL;
                }
            }
        }
    }
}

async fn burst(player: &KeepAlivePlayer, sink_name: &str, pcm: &[u8]) -> Result<(), std::io::Error> {
    let mut child = Command::new(&player.program)
        .args(&player.args)
        .arg(format!("--device={sink_name}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pcm).await?;
        stdin.shutdown().await?;
    }
    child.wait().await?;
    Ok(())
}

/// Generates one burst's worth of 16-bit mono PCM: all-zero for `silence`,
/// a 2 Hz sine at low amplitude for `infrasound` (spec §4.7).
fn generate_burst(method: KeepAliveMethod) -> Vec<u8> {
    let samples = (SAMPLE_RATE * BURST_SECONDS) as usize;
    let mut pcm = Vec::with_capacity(samples * 2);
    match method {
        KeepAliveMethod::Silence => pcm.resize(samples * 2, 0),
        KeepAliveMethod::Infrasound => {
            const FREQ_HZ: f64 = 2.0;
            const AMPLITUDE: f64 = 0.02;
            for i in 0..samples {
                let t = i as f64 / SAMPLE_RATE as f64;
                let sample = (AMPLITUDE * (2.0 * std::f64::consts::PI * FREQ_HZ * t).sin() * i16::MAX as f64) as i16;
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        }
    }
    pcm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_burst_is_all_zero() {
        let pcm = generate_burst(KeepAliveMethod::Silence);
        assert_eq!(pcm.len(), (SAMPLE_RATE * BURST_SECONDS) as usize * 2);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn infrasound_burst_is_not_silent() {
        let pcm = generate_burst(KeepAliveMethod::Infrasound);
        assert!(pcm.iter().any(|&b| b != 0));
    }

    #[tokio::test]
    async fn stop_without_any_burst_returns_promptly() {
        let keep_alive = KeepAlive::start("bluez_sink.test".into(), KeepAliveMethod::Silence, KeepAlivePlayer::default());
        keep_alive.stop().await;
    }
}
