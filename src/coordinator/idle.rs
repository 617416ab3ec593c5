//! Pure idle-mode state machine (spec §4.10 idle-mode table). Kept free of
//! any I/O so the transition logic can be exercised without a live adapter,
//! PulseAudio connection, or timer.

use std::time::Duration;

use crate::model::IdleMode;

/// Where a connected device sits relative to its sink and any pending idle
/// timer. `Playing` is entered on connect and whenever the sink reports
/// `Running` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Playing,
    IdleDefault,
    IdlePowerSavePending,
    IdlePowerSaved,
    IdleKeepAlive,
    IdleAutoDisconnectPending,
}

/// Side effects the coordinator must carry out in response to a
/// transition. Pure functions in this module only ever describe these —
/// they never perform them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    StartSuspendTimer(Duration),
    CancelSuspendTimer,
    StartAutoDisconnectTimer(Duration),
    CancelAutoDisconnectTimer,
    StartKeepAlive,
    StopKeepAlive,
    SuspendSink,
}

/// The sink just went from `Running` to `Idle`: branch on the device's
/// configured idle mode (spec §4.10 idle-mode table).
pub fn on_sink_went_idle(mode: IdleMode, power_save_delay_s: u32, auto_disconnect_minutes: u32) -> (IdleState, Vec<IdleAction>) {
    match mode {
        IdleMode::Default => (IdleState::IdleDefault, Vec::new()),
        IdleMode::PowerSave => (
            IdleState::IdlePowerSavePending,
            vec![IdleAction::StartSuspendTimer(Duration::from_secs(power_save_delay_s as u64))],
        ),
        IdleMode::KeepAlive => (IdleState::IdleKeepAlive, vec![IdleAction::StartKeepAlive]),
        IdleMode::AutoDisconnect => (
            IdleState::IdleAutoDisconnectPending,
            vec![IdleAction::StartAutoDisconnectTimer(Duration::from_secs(auto_disconnect_minutes as u64 * 60))],
        ),
    }
}

/// The sink just went from `Idle`/`Suspended` back to `Running`: cancel
/// whatever was pending, unconditionally (a cancel of a timer that never
/// started is a no-op in the coordinator's maps). Exactly one of a suspend
/// timer, an auto-disconnect timer, or a keep-alive can have been active,
/// so at most one of these three cancellations does anything real
/// (spec §8 property law 5).
pub fn on_sink_went_running() -> (IdleState, Vec<IdleAction>) {
    (
        IdleState::Playing,
        vec![IdleAction::CancelSuspendTimer, IdleAction::CancelAutoDisconnectTimer, IdleAction::StopKeepAlive],
    )
}

/// The power-save suspend timer fired without the sink having gone
/// `Running` again in the meantime.
pub fn on_power_save_timer_fired() -> (IdleState, Vec<IdleAction>) {
    (IdleState::IdlePowerSaved, vec![IdleAction::SuspendSink])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_starts_no_timer() {
        let (state, actions) = on_sink_went_idle(IdleMode::Default, 30, 10);
        assert_eq!(state, IdleState::IdleDefault);
        assert!(actions.is_empty());
    }

    #[test]
    fn power_save_mode_starts_suspend_timer_with_configured_delay() {
        let (state, actions) = on_sink_went_idle(IdleMode::PowerSave, 45, 10);
        assert_eq!(state, IdleState::IdlePowerSavePending);
        assert_eq!(actions, vec![IdleAction::StartSuspendTimer(Duration::from_secs(45))]);
    }

    #[test]
    fn keep_alive_mode_starts_keep_alive_immediately() {
        let (state, actions) = on_sink_went_idle(IdleMode::KeepAlive, 30, 10);
        assert_eq!(state, IdleState::IdleKeepAlive);
        assert_eq!(actions, vec![IdleAction::StartKeepAlive]);
    }

    #[test]
    fn auto_disconnect_mode_starts_timer_in_minutes() {
        let (state, actions) = on_sink_went_idle(IdleMode::AutoDisconnect, 30, 5);
        assert_eq!(state, IdleState::IdleAutoDisconnectPending);
        assert_eq!(actions, vec![IdleAction::StartAutoDisconnectTimer(Duration::from_secs(300))]);
    }

    #[test]
    fn sink_going_running_cancels_every_pending_timer_and_keep_alive() {
        let (state, actions) = on_sink_went_running();
        assert_eq!(state, IdleState::Playing);
        assert!(actions.contains(&IdleAction::CancelSuspendTimer));
        assert!(actions.contains(&IdleAction::CancelAutoDisconnectTimer));
        assert!(actions.contains(&IdleAction::StopKeepAlive));
    }

    #[test]
    fn power_save_timer_firing_suspends_the_sink() {
        let (state, actions) = on_power_save_timer_fired();
        assert_eq!(state, IdleState::IdlePowerSaved);
        assert_eq!(actions, vec![IdleAction::SuspendSink]);
    }

    #[test]
    fn no_transition_ever_starts_two_timers_at_once() {
        for mode in [IdleMode::Default, IdleMode::PowerSave, IdleMode::KeepAlive, IdleMode::AutoDisconnect] {
            let (_, actions) = on_sink_went_idle(mode, 30, 10);
            let timer_starts = actions
                .iter()
                .filter(|a| matches!(a, IdleAction::StartSuspendTimer(_) | IdleAction::StartAutoDisconnectTimer(_)))
                .count();
            assert!(timer_starts <= 1, "mode {mode:?} started more than one timer");
        }
    }
}
