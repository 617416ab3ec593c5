//! Async PulseAudio client (spec §4.6).
//!
//! Grounded on `other_examples/.../maxdexh-scratchbar/pulse.rs`: a
//! dedicated OS thread drives a `libpulse_binding` standard mainloop, and
//! async callers talk to it over channels. That example watches one sink's
//! volume; this one drives card/sink enumeration, profile switching, and
//! suspend/resume, plus a reconnect-with-backoff loop around the whole
//! thread (spec §4.6's "reconnect with exponential backoff 1s -> 30s").

mod worker;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::CoreError;
use crate::model::DeviceAddress;

pub use worker::{PulseCard, PulseEvent, PulseSink, SinkState};

/// Profile name candidates tried in order until one succeeds (spec §4.6).
pub const A2DP_PROFILE_NAMES: &[&str] = &["a2dp_sink", "a2dp-sink"];
pub const HFP_PROFILE_NAMES: &[&str] = &["handsfree_head_unit", "headset_head_unit", "hands-free-head-unit", "headset-head-unit"];

#[derive(Debug)]
pub(crate) enum PulseCommand {
    ListCards(oneshot::Sender<Result<Vec<PulseCard>, CoreError>>),
    ListSinks(oneshot::Sender<Result<Vec<PulseSink>, CoreError>>),
    SetCardProfile { card_name: String, profile: String, reply: oneshot::Sender<Result<(), CoreError>> },
    SuspendSink { sink_name: String, reply: oneshot::Sender<Result<(), CoreError>> },
    ResumeSink { sink_name: String, reply: oneshot::Sender<Result<(), CoreError>> },
}

/// Async handle to the background PulseAudio worker thread.
pub struct PulseClient {
    cmd_tx: mpsc::Sender<PulseCommand>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PulseEvent>>>,
}

impl PulseClient {
    /// Connects to the local PulseAudio socket, probing candidate server
    /// strings in order (spec §4.6, §6). Spawns the background worker
    /// thread which owns the actual `libpulse_binding` mainloop, subscribes
    /// to sink add/remove/state/volume/mute notifications, and reconnects
    /// on its own with exponential backoff if the server restarts
    /// underneath it.
    pub async fn connect(server_candidates: Vec<String>) -> Result<Self, CoreError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pulse-worker".into())
            .spawn(move || worker::run(server_candidates, cmd_rx, ready_tx, events_tx))
            .map_err(|e| CoreError::PulseUnavailable(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| CoreError::PulseUnavailable("worker thread died before connecting".into()))??;

        Ok(Self { cmd_tx, events: std::sync::Mutex::new(Some(events_rx)) })
    }

    /// Takes the sink-event stream, once. Mirrors the `mpris_commands`
    /// take-once handle on [`crate::context::Context`] — whichever task
    /// starts consuming subscription events owns the receiver for the rest
    /// of the process's life.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PulseEvent>> {
        self.events.lock().unwrap().take()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T, CoreError>>) -> PulseCommand) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| CoreError::PulseUnavailable("worker thread is gone".into()))?;
        rx.await.map_err(|_| CoreError::PulseUnavailable("worker thread dropped the reply".into()))?
    }

    pub async fn list_cards(&self) -> Result<Vec<PulseCard>, CoreError> {
        self.call(PulseCommand::ListCards).await
    }

    pub async fn list_sinks(&self) -> Result<Vec<PulseSink>, CoreError> {
        self.call(PulseCommand::ListSinks).await
    }

    /// Tries each candidate profile name in order until BlueZ accepts one
    /// (spec §4.6's "known name set").
    pub async fn set_card_profile(&self, card_name: &str, candidates: &[&str]) -> Result<(), CoreError> {
        let mut last_err = CoreError::AudioProfileFailed;
        for candidate in candidates {
            let (tx, rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(PulseCommand::SetCardProfile {
                    card_name: card_name.to_string(),
                    profile: candidate.to_string(),
                    reply: tx,
                })
                .await
                .is_err()
            {
                return Err(CoreError::PulseUnavailable("worker thread is gone".into()));
            }
            match rx.await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_err = e,
                Err(_) => return Err(CoreError::PulseUnavailable("worker thread dropped the reply".into())),
            }
        }
        Err(last_err)
    }

    /// Sink-naming convention: `bluez_sink.<MAC_WITH_UNDERSCORES>.<profile>`,
    /// matched case-insensitively on the MAC portion (spec §4.6).
    pub fn sink_name_matches(sink_name: &str, address: &DeviceAddress) -> bool {
        sink_name.to_ascii_uppercase().contains(&address.path_form())
    }

    /// Waits up to `timeout` for a sink whose name matches `address` to
    /// appear (spec §4.10 step 7, §5's 30s `wait_for_sink`).
    pub async fn wait_for_sink(&self, address: &DeviceAddress, timeout: Duration) -> Result<PulseSink, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sinks = self.list_sinks().await?;
            if let Some(sink) = sinks.into_iter().find(|s| Self::sink_name_matches(&s.name, address)) {
                return Ok(sink);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::SinkTimeout);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub async fn suspend_sink(&self, sink_name: &str) -> Result<(), CoreError> {
        self.call(|reply| PulseCommand::SuspendSink { sink_name: sink_name.to_string(), reply }).await
    }

    pub async fn resume_sink(&self, sink_name: &str) -> Result<(), CoreError> {
        self.call(|reply| PulseCommand::ResumeSink { sink_name: sink_name.to_string(), reply }).await
    }

    /// Finds the card + sink pair belonging to a managed Bluetooth device.
    pub async fn find_card_for(&self, address: &DeviceAddress) -> Result<Option<PulseCard>, CoreError> {
        let cards = self.list_cards().await?;
        Ok(cards.into_iter().find(|c| c.name.to_ascii_uppercase().contains(&address.path_form())))
    }

    pub async fn bluetooth_sinks(&self) -> Result<Vec<PulseSink>, CoreError> {
        let sinks = self.list_sinks().await?;
        Ok(sinks.into_iter().filter(|s| s.name.starts_with("bluez_sink.")).collect())
    }
}

pub fn known_profile_names_for(target: crate::model::AudioProfile) -> &'static [&'static str] {
    match target {
        crate::model::AudioProfile::A2dp => A2DP_PROFILE_NAMES,
        crate::model::AudioProfile::Hfp => HFP_PROFILE_NAMES,
    }
}
