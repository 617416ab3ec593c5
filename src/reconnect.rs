//! Per-device reconnection scheduling with randomized exponential backoff
//! (spec §4.9).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::info;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::event_bus::{Event, EventBus};
use crate::model::DeviceAddress;

const FIRST_ATTEMPT_DELAY: Duration = Duration::from_secs(10);
const ADAPTER_DISRUPTION_THRESHOLD: usize = 2;
const ADAPTER_DISRUPTION_WINDOW: Duration = Duration::from_secs(3);
const SUPPRESSION_WINDOW: Duration = Duration::from_secs(60);
const BOOTSTRAP_STAGGER_MAX: Duration = Duration::from_millis(2000);

/// Backoff parameters, read fresh from [`crate::model::GlobalSettings`] by
/// the caller on every schedule call so a settings change takes effect on
/// the next attempt without restarting the controller.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_seconds: u64,
    pub max_backoff_seconds: u64,
}

/// Emitted when a scheduled attempt comes due. The receiver (the
/// coordinator) is responsible for checking the firing-time conditions
/// (spec §4.9) and calling back [`ReconnectController::on_attempt_failed`],
/// [`ReconnectController::on_attempt_succeeded`], or
/// [`ReconnectController::cancel`].
#[derive(Debug, Clone)]
pub struct ReconnectDue {
    pub address: DeviceAddress,
    pub attempt: u32,
}

struct Scheduled {
    attempt: u32,
    handle: JoinHandle<()>,
}

struct Inner {
    scheduled: HashMap<DeviceAddress, Scheduled>,
    recent_disconnects: VecDeque<Instant>,
    suppressed_until: Option<Instant>,
}

/// Per-device reconnect scheduler (spec §4.9). Cloning shares the same
/// schedule.
#[derive(Clone)]
pub struct ReconnectController {
    inner: std::sync::Arc<Mutex<Inner>>,
    due_tx: mpsc::UnboundedSender<ReconnectDue>,
    event_bus: EventBus,
}

impl ReconnectController {
    pub fn new(event_bus: EventBus) -> (Self, mpsc::UnboundedReceiver<ReconnectDue>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let controller = Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                scheduled: HashMap::new(),
                recent_disconnects: VecDeque::new(),
                suppressed_until: None,
            })),
            due_tx,
            event_bus,
        };
        (controller, due_rx)
    }

    /// Records a BlueZ-observed disconnect and schedules the first
    /// reconnect attempt (fixed 10 s). Also feeds the adapter-disruption
    /// guard: if `N` devices disconnect within a 3 s window, a 60 s
    /// suppression window opens and a `status` event is published
    /// (spec §4.9).
    pub async fn on_unexpected_disconnect(&self, address: DeviceAddress, _config: ReconnectConfig) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.recent_disconnects.push_back(now);
        while let Some(front) = inner.recent_disconnects.front()
            && now.duration_since(*front) > ADAPTER_DISRUPTION_WINDOW
        {
            inner.recent_disconnects.pop_front();
        }
        if inner.recent_disconnects.len() >= ADAPTER_DISRUPTION_THRESHOLD
            && inner.suppressed_until.is_none_or(|until| until <= now)
        {
            inner.suppressed_until = Some(now + SUPPRESSION_WINDOW);
            info!("adapter disruption detected, suppressing reconnects for 60s");
            self.event_bus.publish(Event::Status(Some(
                "multiple devices disconnected at once; suppressing reconnects for 60s".to_string(),
            )));
        }
        let extra_delay = inner
            .suppressed_until
            .filter(|until| *until > now)
            .map(|until| until - now)
            .unwrap_or_default();
        self.schedule_locked(&mut inner, address, 1, extra_delay + jittered(FIRST_ATTEMPT_DELAY));
    }

    /// Drops any scheduled attempt for `address` (spec §4.9: forget, user
    /// disconnect, firing-time condition failure, or successful connect all
    /// call this).
    pub async fn cancel(&self, address: &DeviceAddress) {
        let mut inner = self.inner.lock().await;
        if let Some(scheduled) = inner.scheduled.remove(address) {
            scheduled.handle.abort();
        }
    }

    /// At startup, schedules an attempt for every `auto_connect` device,
    /// staggered 0-2 s apart (spec §4.10 step 10).
    pub async fn bootstrap(&self, addresses: Vec<DeviceAddress>) {
        let mut inner = self.inner.lock().await;
        for address in addresses {
            let stagger = Duration::from_millis(rand::rng().random_range(0..=BOOTSTRAP_STAGGER_MAX.as_millis() as u64));
            self.schedule_locked(&mut inner, address, 1, stagger);
        }
    }

    /// Schedules the next backoff attempt after a failed connect, unless the
    /// caller has already cancelled this device's schedule.
    pub async fn on_attempt_failed(&self, address: DeviceAddress, attempt: u32, config: ReconnectConfig) {
        let mut inner = self.inner.lock().await;
        let delay = jittered(next_backoff(&config, attempt + 1));
        self.schedule_locked(&mut inner, address, attempt + 1, delay);
    }

    pub async fn on_attempt_succeeded(&self, address: &DeviceAddress) {
        self.cancel(address).await;
    }

    fn schedule_locked(&self, inner: &mut Inner, address: DeviceAddress, attempt: u32, delay: Duration) {
        if let Some(previous) = inner.scheduled.remove(&address) {
            previous.handle.abort();
        }
        let due_tx = self.due_tx.clone();
        let scheduled_address = address.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(ReconnectDue { address: scheduled_address, attempt });
        });
        inner.scheduled.insert(address, Scheduled { attempt, handle });
    }
}

/// Pure backoff formula for the `attempt`-th fire (1-indexed): `attempt=1`
/// is the fixed 10 s fast-retry; `attempt>=2` is `base * 1.5^(attempt-2)`,
/// capped at `max_backoff` (spec §4.9, §8 property law 3 / scenario S2).
fn next_backoff(config: &ReconnectConfig, attempt: u32) -> Duration {
    if attempt <= 1 {
        return FIRST_ATTEMPT_DELAY;
    }
    let raw = config.base_seconds as f64 * 1.5f64.powi(attempt as i32 - 2);
    let capped = raw.min(config.max_backoff_seconds as f64);
    Duration::from_secs_f64(capped)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(-0.2..=0.2);
    Duration::from_secs_f64((base.as_secs_f64() * (1.0 + factor)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReconnectConfig {
        ReconnectConfig { base_seconds: 30, max_backoff_seconds: 300 }
    }

    #[test]
    fn attempt_one_is_fixed_ten_seconds() {
        assert_eq!(next_backoff(&cfg(), 1), Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_by_one_point_five_and_caps() {
        // S2: base=30, cap=300 -> attempt2 raw=30, attempt3=45, attempt4=67.5
        assert_eq!(next_backoff(&cfg(), 2), Duration::from_secs_f64(30.0));
        assert_eq!(next_backoff(&cfg(), 3), Duration::from_secs_f64(45.0));
        assert_eq!(next_backoff(&cfg(), 4), Duration::from_secs_f64(67.5));
    }

    #[test]
    fn backoff_is_capped_at_max() {
        let capped = next_backoff(&cfg(), 20);
        assert_eq!(capped, Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..200 {
            let jittered = jittered(Duration::from_secs(30));
            let secs = jittered.as_secs_f64();
            assert!((24.0..=36.0).contains(&secs), "{secs} out of bounds");
        }
    }

    #[tokio::test]
    async fn cancel_drops_scheduled_attempt_before_it_fires() {
        let (controller, mut due_rx) = ReconnectController::new(EventBus::new());
        let addr = DeviceAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        controller
            .on_unexpected_disconnect(addr.clone(), cfg())
            .await;
        controller.cancel(&addr).await;
        let result = tokio::time::timeout(Duration::from_millis(200), due_rx.recv()).await;
        assert!(result.is_err(), "cancelled attempt must not fire");
    }

    #[tokio::test]
    async fn two_disconnects_within_window_trigger_suppression_status() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Default::default());
        let (controller, _due_rx) = ReconnectController::new(bus);
        let a = DeviceAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        let b = DeviceAddress::parse("AA:BB:CC:DD:EE:02").unwrap();
        controller.on_unexpected_disconnect(a, cfg()).await;
        controller.on_unexpected_disconnect(b, cfg()).await;

        let mut saw_status = false;
        while let Ok(event) = sub.rx.try_recv() {
            if matches!(event, Event::Status(Some(_))) {
                saw_status = true;
            }
        }
        assert!(saw_status);
    }
}
