//! Flow monitor (C6): periodic anomaly detector for no-flow-while-open and
//! unexpected-flow-while-idle conditions.

use crate::channel::{ChannelStore, LockLevel, LockReason};
use crate::executor::ActiveTask;
use crate::lock::{LockManager, NO_FLOW_RETRY_COOLDOWN_SEC};
use crate::pulse::PulseCounter;
use crate::state::{StateCoordinator, SystemStatus};
use crate::valve::ValvePort;

pub const FLOW_CHECK_THRESHOLD_MS: u64 = 1_000;
pub const MAX_FLOW_ERROR_ATTEMPTS: u32 = 3;
pub const NO_FLOW_GRACE_SEC: i64 = 5;
pub const UNEXPECTED_FLOW_THRESHOLD: u32 = 5;

#[derive(Debug, Default)]
pub struct MonitorState {
    pub no_flow_attempts: u32,
    pub last_idle_window_pulses: u32,
}

pub enum MonitorOutcome {
    Nothing,
    NoFlowAbort,
    FaultEscalated,
    UnexpectedFlowDetected,
    IdleRecovered,
    PulseCounterSaturated,
}

/// One flow-monitor tick. Call every `FLOW_CHECK_THRESHOLD_MS` with the
/// system mutex held.
#[allow(clippy::too_many_arguments)]
pub fn tick(
    monitor: &mut MonitorState,
    channels: &mut ChannelStore,
    locks: &mut LockManager,
    state: &mut StateCoordinator,
    pulses: &PulseCounter,
    valve: &mut dyn ValvePort,
    active: &mut Option<ActiveTask>,
    now_epoch: i64,
) -> MonitorOutcome {
    use crate::state::SystemState;

    // §8: a pulse counter reaching u32::MAX must fault rather than wrap.
    // `increment()` leaves it saturated; this is the policy check that
    // turns that into a system fault.
    if pulses.is_saturated() {
        if active.is_some() {
            crate::executor::abort(channels, state, valve, active, "PulseOverflow".to_string()).ok();
        }
        valve.close_all();
        state.force_fault();
        return MonitorOutcome::PulseCounterSaturated;
    }

    if let Some(at) = active {
        if state.state() == SystemState::Watering
            && now_epoch - at.start_epoch > NO_FLOW_GRACE_SEC
            && pulses.get() == 0
        {
            monitor.no_flow_attempts += 1;
            let channel_id = at.task.channel_id;
            crate::executor::abort(
                channels,
                state,
                valve,
                active,
                "NoFlow".to_string(),
            )
            .ok();
            state.set_status_unless_fault(SystemStatus::NoFlow);

            if monitor.no_flow_attempts >= MAX_FLOW_ERROR_ATTEMPTS {
                valve.close_all();
                state.force_fault();
                return MonitorOutcome::FaultEscalated;
            }

            locks.set_channel(
                channels,
                channel_id,
                LockLevel::Soft,
                LockReason::NoFlow,
                now_epoch,
                now_epoch + NO_FLOW_RETRY_COOLDOWN_SEC,
                state,
            );
            return MonitorOutcome::NoFlowAbort;
        }

        if pulses.get() > 0 {
            monitor.no_flow_attempts = 0;
            if state.status() == SystemStatus::NoFlow {
                state.set_status_unless_fault(SystemStatus::Ok);
            }
        }
        return MonitorOutcome::Nothing;
    }

    // No active task: watch for unexpected flow.
    let observed = pulses.get();
    if observed > UNEXPECTED_FLOW_THRESHOLD {
        pulses.reset();
        locks.set_global(
            LockLevel::Soft,
            LockReason::UnexpectedFlow,
            now_epoch,
            now_epoch + NO_FLOW_RETRY_COOLDOWN_SEC,
            state,
        );
        monitor.last_idle_window_pulses = observed;
        return MonitorOutcome::UnexpectedFlowDetected;
    }

    if state.status() == SystemStatus::UnexpectedFlow
        && observed < UNEXPECTED_FLOW_THRESHOLD / 2
    {
        state.set_status_unless_fault(SystemStatus::Ok);
        pulses.reset();
        return MonitorOutcome::IdleRecovered;
    }

    pulses.reset();
    MonitorOutcome::Nothing
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::task::{Task, TaskMode, Trigger};
    use crate::valve::SimValveBoard;

    fn setup_active(channels: &mut ChannelStore) -> Option<ActiveTask> {
        let mut c = Channel::new(3, "z3");
        c.pulses_per_liter = Some(750);
        channels.set(3, c);
        Some(ActiveTask {
            task: Task::new(3, Trigger::Manual, TaskMode::ByVolume { liters: 1 }, 0),
            start_epoch: 0,
            elapsed_ms_at_pause: 0,
            pulses_at_pause: 0,
            paused_at_epoch: 0,
        })
    }

    // -- S2: no-flow fault escalation ----------------------------------------

    #[test]
    fn s2_no_flow_sets_soft_lock_and_aborts() {
        let mut channels = ChannelStore::new();
        let mut active = setup_active(&mut channels);
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        let mut valve = SimValveBoard::new();
        state.transition(crate::state::SystemState::Watering).unwrap();
        let mut monitor = MonitorState::default();

        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            6,
        );
        assert!(matches!(outcome, MonitorOutcome::NoFlowAbort));
        assert!(active.is_none());
        assert_eq!(channels.get(3).unwrap().lock.level, LockLevel::Soft);
        assert_eq!(state.status(), SystemStatus::NoFlow);
    }

    #[test]
    fn s2_repeated_no_flow_escalates_to_fault() {
        let mut channels = ChannelStore::new();
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let mut valve = SimValveBoard::new();
        let mut monitor = MonitorState::default();

        for attempt in 0..MAX_FLOW_ERROR_ATTEMPTS {
            let pulses = PulseCounter::new(0);
            let mut active = setup_active(&mut channels);
            state.transition(crate::state::SystemState::Watering).unwrap();
            let outcome = tick(
                &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve,
                &mut active, 6,
            );
            if attempt + 1 < MAX_FLOW_ERROR_ATTEMPTS {
                assert!(matches!(outcome, MonitorOutcome::NoFlowAbort));
            } else {
                assert!(matches!(outcome, MonitorOutcome::FaultEscalated));
                assert_eq!(state.status(), SystemStatus::Fault);
            }
        }
    }

    #[test]
    fn flowing_task_clears_no_flow_attempts() {
        let mut channels = ChannelStore::new();
        let mut active = setup_active(&mut channels);
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        pulses.increment();
        let mut valve = SimValveBoard::new();
        state.transition(crate::state::SystemState::Watering).unwrap();
        let mut monitor = MonitorState {
            no_flow_attempts: 2,
            ..Default::default()
        };
        tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            6,
        );
        assert_eq!(monitor.no_flow_attempts, 0);
    }

    #[test]
    fn within_grace_period_no_action_taken() {
        let mut channels = ChannelStore::new();
        let mut active = setup_active(&mut channels);
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        let mut valve = SimValveBoard::new();
        state.transition(crate::state::SystemState::Watering).unwrap();
        let mut monitor = MonitorState::default();
        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            2,
        );
        assert!(matches!(outcome, MonitorOutcome::Nothing));
        assert!(active.is_some());
    }

    // -- Pulse counter saturation --------------------------------------------

    #[test]
    fn saturated_pulse_counter_faults_and_aborts_active_task() {
        let mut channels = ChannelStore::new();
        let mut active = setup_active(&mut channels);
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        pulses.force_saturated_for_test();
        let mut valve = SimValveBoard::new();
        state.transition(crate::state::SystemState::Watering).unwrap();
        let mut monitor = MonitorState::default();

        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            6,
        );
        assert!(matches!(outcome, MonitorOutcome::PulseCounterSaturated));
        assert!(active.is_none());
        assert_eq!(state.status(), SystemStatus::Fault);
    }

    #[test]
    fn saturated_pulse_counter_faults_even_while_idle() {
        let mut channels = ChannelStore::new();
        let mut active = None;
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        pulses.force_saturated_for_test();
        let mut valve = SimValveBoard::new();
        let mut monitor = MonitorState::default();

        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            6,
        );
        assert!(matches!(outcome, MonitorOutcome::PulseCounterSaturated));
        assert_eq!(state.status(), SystemStatus::Fault);
    }

    // -- S3: unexpected flow while idle --------------------------------------

    #[test]
    fn s3_unexpected_flow_while_idle_sets_global_lock() {
        let mut channels = ChannelStore::new();
        let mut active = None;
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        for _ in 0..50 {
            pulses.increment();
        }
        let mut valve = SimValveBoard::new();
        let mut monitor = MonitorState::default();

        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            100,
        );
        assert!(matches!(outcome, MonitorOutcome::UnexpectedFlowDetected));
        assert_eq!(locks.global().level, LockLevel::Soft);
        assert_eq!(state.status(), SystemStatus::UnexpectedFlow);
        assert_eq!(pulses.get(), 0);
    }

    #[test]
    fn s3_status_recovers_when_pulses_drop_below_half_threshold() {
        let mut channels = ChannelStore::new();
        let mut active = None;
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        let mut valve = SimValveBoard::new();
        let mut monitor = MonitorState::default();
        state.set_status_unless_fault(SystemStatus::UnexpectedFlow);

        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            100,
        );
        assert!(matches!(outcome, MonitorOutcome::IdleRecovered));
        assert_eq!(state.status(), SystemStatus::Ok);
    }

    #[test]
    fn idle_with_no_pulses_is_a_no_op() {
        let mut channels = ChannelStore::new();
        let mut active = None;
        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        let pulses = PulseCounter::new(0);
        let mut valve = SimValveBoard::new();
        let mut monitor = MonitorState::default();
        let outcome = tick(
            &mut monitor, &mut channels, &mut locks, &mut state, &pulses, &mut valve, &mut active,
            100,
        );
        assert!(matches!(outcome, MonitorOutcome::Nothing));
    }
}
