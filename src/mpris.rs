//! MPRIS media-player object exposed on the bus so BlueZ's AVRCP target role
//! delivers remote-control commands as callbacks (spec §4.5).
//!
//! Grounded on the teacher's direct `zbus` usage in `main.rs`
//! (`zbus::Connection::system`, `zbus::proxy::Builder`, hand-scanning
//! `PropertiesChanged`) — the serving side here is the mirror image, a
//! `#[zbus::interface]` object instead of a proxy.

use std::sync::Arc;

use log::info;
use tokio::sync::{mpsc, Mutex};
use zbus::object_server::SignalContext;

use crate::model::DeviceAddress;

pub const MPRIS_WELL_KNOWN_NAME: &str = "org.mpris.MediaPlayer2.btaudiod";
pub const MPRIS_OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Stopped => "Stopped",
        }
    }
}

/// Callback payload the coordinator receives for every AVRCP-originated
/// command (spec §4.5).
#[derive(Debug, Clone)]
pub struct MprisCommand {
    pub address_hint: Option<DeviceAddress>,
    pub command: MprisCommandKind,
}

#[derive(Debug, Clone)]
pub enum MprisCommandKind {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Seek(i64),
    Raise,
    Volume(u8),
}

struct PlayerState {
    status: PlaybackStatus,
    volume_pct: u8,
}

/// The served `org.mpris.MediaPlayer2` + `.Player` object. All properties
/// are read-only to bus callers; the daemon updates them internally as
/// commands are applied (spec §4.5).
pub struct MprisPlayer {
    state: Arc<Mutex<PlayerState>>,
    command_tx: mpsc::UnboundedSender<MprisCommand>,
}

impl MprisPlayer {
    pub fn new(command_tx: mpsc::UnboundedSender<MprisCommand>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlayerState {
                status: PlaybackStatus::Stopped,
                volume_pct: 100,
            })),
            command_tx,
        }
    }

    fn emit(&self, command: MprisCommandKind) {
        let _ = self.command_tx.send(MprisCommand { address_hint: None, command });
    }
}

#[zbus::interface(name = "org.mpris.MediaPlayer2")]
impl MprisPlayer {
    #[zbus(property)]
    fn can_quit(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_raise(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn identity(&self) -> String {
        "btaudiod".to_string()
    }

    fn raise(&self) {
        info!("MPRIS Raise received");
        self.emit(MprisCommandKind::Raise);
    }

    fn quit(&self) {}
}

#[zbus::interface(name = "org.mpris.MediaPlayer2.Player")]
impl MprisPlayer {
    #[zbus(property)]
    async fn playback_status(&self) -> String {
        self.state.lock().await.status.as_str().to_string()
    }

    #[zbus(property)]
    async fn volume(&self) -> f64 {
        self.state.lock().await.volume_pct as f64 / 100.0
    }

    #[zbus(property)]
    async fn set_volume(
        &self,
        #[zbus(signal_context)] ctx: SignalContext<'_>,
        value: f64,
    ) -> zbus::fdo::Result<()> {
        let pct = (value.clamp(0.0, 1.0) * 100.0).round() as u8;
        {
            let mut state = self.state.lock().await;
            state.volume_pct = pct;
        }
        self.emit(MprisCommandKind::Volume(pct));
        Self::volume_changed(&ctx).await?;
        Ok(())
    }

    #[zbus(property)]
    fn can_control(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_play(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_pause(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_go_next(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_go_previous(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_seek(&self) -> bool {
        true
    }

    async fn play(&self, #[zbus(signal_context)] ctx: SignalContext<'_>) -> zbus::fdo::Result<()> {
        self.set_status(PlaybackStatus::Playing, &ctx).await;
        self.emit(MprisCommandKind::Play);
        Ok(())
    }

    async fn pause(&self, #[zbus(signal_context)] ctx: SignalContext<'_>) -> zbus::fdo::Result<()> {
        self.set_status(PlaybackStatus::Paused, &ctx).await;
        self.emit(MprisCommandKind::Pause);
        Ok(())
    }

    async fn play_pause(&self, #[zbus(signal_context)] ctx: SignalContext<'_>) -> zbus::fdo::Result<()> {
        let playing = matches!(self.state.lock().await.status, PlaybackStatus::Playing);
        if playing {
            self.pause(ctx).await
        } else {
            self.play(ctx).await
        }
    }

    async fn stop(&self, #[zbus(signal_context)] ctx: SignalContext<'_>) -> zbus::fdo::Result<()> {
        self.set_status(PlaybackStatus::Stopped, &ctx).await;
        self.emit(MprisCommandKind::Stop);
        Ok(())
    }

    fn next(&self) {
        self.emit(MprisCommandKind::Next);
    }

    fn previous(&self) {
        self.emit(MprisCommandKind::Previous);
    }

    fn seek(&self, offset_us: i64) {
        self.emit(MprisCommandKind::Seek(offset_us));
    }
}

impl MprisPlayer {
    async fn set_status(&self, status: PlaybackStatus, ctx: &SignalContext<'_>) {
        {
            let mut state = self.state.lock().await;
            state.status = status;
        }
        let _ = Self::playback_status_changed(ctx).await;
    }
}

/// Registers the MPRIS object on the system bus under the well-known name,
/// per spec §4.5 ("registration must happen before the first device
/// connect").
pub async fn register(
    conn: &zbus::Connection,
    command_tx: mpsc::UnboundedSender<MprisCommand>,
) -> zbus::Result<()> {
    let player = MprisPlayer::new(command_tx);
    conn.object_server().at(MPRIS_OBJECT_PATH, player).await?;
    conn.request_name(MPRIS_WELL_KNOWN_NAME).await?;
    Ok(())
}
