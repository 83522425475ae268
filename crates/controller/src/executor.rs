//! Task executor (C5): the single-active-task state machine.
//!
//! Implemented as a set of pure-ish operations over explicit state rather
//! than its own async task loop — the same `handle_*`-over-shared-state
//! shape this codebase's auto-watering scheduler used — so the periodic
//! caller (an interval tick owned by the process entry point) can drive it
//! under the system mutex without any hidden internal concurrency.

use crate::channel::ChannelStore;
use crate::error::{ControlError, ControlResult};
use crate::lock::LockManager;
use crate::pulse::{ml_delivered, target_pulses, PulseCounter};
use crate::queue::TaskQueue;
use crate::rain::{self, RainfallSource};
use crate::state::{requested_ml, StateCoordinator, SystemEvent, SystemState, TaskPhase};
use crate::task::{Task, TaskMode};
use crate::valve::ValvePort;

pub const PAUSE_MAX_SEC: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveTask {
    pub task: Task,
    pub start_epoch: i64,
    pub elapsed_ms_at_pause: i64,
    pub pulses_at_pause: u32,
    pub paused_at_epoch: i64,
}

impl ActiveTask {
    fn effective_elapsed_ms(&self, now_epoch: i64) -> i64 {
        self.elapsed_ms_at_pause + (now_epoch - self.start_epoch) * 1000
    }
}

fn expected_duration_sec(liters: u16, nominal_flow_ml_min: f32) -> f64 {
    if nominal_flow_ml_min <= 0.0 {
        return 0.0;
    }
    (liters as f64 * 1000.0 / nominal_flow_ml_min as f64) * 60.0
}

/// Attempts to dequeue and start the next task. No-ops (returns `Ok(false)`)
/// if a task is already active, the system is at fault, or the queue is
/// empty.
#[allow(clippy::too_many_arguments)]
pub fn try_start_next(
    channels: &mut ChannelStore,
    queue: &mut TaskQueue,
    locks: &LockManager,
    state: &mut StateCoordinator,
    pulses: &PulseCounter,
    valve: &mut dyn ValvePort,
    active: &mut Option<ActiveTask>,
    rainfall: &dyn RainfallSource,
    now_epoch: i64,
) -> ControlResult<bool> {
    use crate::state::SystemStatus;

    if active.is_some() || state.state() != SystemState::Idle {
        return Ok(false);
    }
    if state.status() == SystemStatus::Fault {
        return Ok(false);
    }

    let task = match queue.dequeue() {
        Some(t) => t,
        None => return Ok(false),
    };

    let channel = match channels.get(task.channel_id) {
        Some(c) => c.clone(),
        None => return Err(ControlError::InvalidParam("unknown channel".into())),
    };

    // Step 1: rain compensation may rewrite the task or skip it entirely.
    let (adjusted_mode, impact) = rain::apply(&channel.rain_compensation, rainfall, task.mode);
    let mode = match adjusted_mode {
        Some(m) => m,
        None => {
            state.emit(SystemEvent::TaskLifecycle {
                phase: TaskPhase::Skipped,
                channel: task.channel_id,
                requested_ml: Some(requested_ml(task.mode, channel.nominal_flow_ml_min)),
                delivered_ml: None,
                reason: Some(format!("Rain{:?}", impact)),
            });
            return Ok(false);
        }
    };

    // Step 2: re-check locks and AUTO-validity.
    let manual_override = locks.is_manual_override_active(task.channel_id, now_epoch);
    if channel.lock.is_blocking(now_epoch) && !manual_override {
        return Err(ControlError::Locked {
            channel: task.channel_id,
            retry_after_epoch: channel.lock.retry_after_epoch,
        });
    }
    if task.mode.validate().is_err() {
        return Err(ControlError::InvalidParam("invalid task mode".into()));
    }

    // Step 3: open valve, reset pulses, transition to WATERING.
    pulses.reset();
    valve.open(task.channel_id)?;
    state.transition(SystemState::Watering)?;

    let started = Task { mode, ..task };
    *active = Some(ActiveTask {
        task: started,
        start_epoch: now_epoch,
        elapsed_ms_at_pause: 0,
        pulses_at_pause: 0,
        paused_at_epoch: 0,
    });

    state.emit(SystemEvent::TaskLifecycle {
        phase: TaskPhase::Started,
        channel: task.channel_id,
        requested_ml: Some(requested_ml(mode, channel.nominal_flow_ml_min)),
        delivered_ml: None,
        reason: None,
    });

    if let Some(ch) = channels.get_mut(task.channel_id) {
        ch.last_watering_epoch = now_epoch;
    }

    Ok(true)
}

pub enum TickOutcome {
    StillRunning,
    Completed,
    AutoAbortedPauseTimeout,
}

/// Checks the termination condition for the currently active task and
/// closes it out if reached. Must be called only while `state == WATERING`.
pub fn tick(
    channels: &ChannelStore,
    state: &mut StateCoordinator,
    pulses: &PulseCounter,
    valve: &mut dyn ValvePort,
    active: &mut Option<ActiveTask>,
    flow_calibration_pulses_per_liter: u32,
    now_epoch: i64,
) -> ControlResult<TickOutcome> {
    let at = match active {
        Some(a) => *a,
        None => return Ok(TickOutcome::StillRunning),
    };

    if state.state() == SystemState::Paused {
        if now_epoch - at.paused_at_epoch >= PAUSE_MAX_SEC {
            abort(channels, state, valve, active, "PauseTimeout".into())?;
            return Ok(TickOutcome::AutoAbortedPauseTimeout);
        }
        return Ok(TickOutcome::StillRunning);
    }

    let channel = channels.get(at.task.channel_id).cloned();
    let pulses_per_liter = channel
        .as_ref()
        .and_then(|c| c.pulses_per_liter)
        .unwrap_or(flow_calibration_pulses_per_liter);

    let terminated = match at.task.mode {
        TaskMode::ByDuration { minutes } => {
            at.effective_elapsed_ms(now_epoch) >= minutes as i64 * 60_000
        }
        TaskMode::ByVolume { liters } => {
            let target = target_pulses(liters as u32, pulses_per_liter);
            let over_time_cap = channel.as_ref().map_or(false, |c| {
                let cap_sec = 2.0 * expected_duration_sec(liters, c.nominal_flow_ml_min) + 60.0;
                (at.effective_elapsed_ms(now_epoch) as f64 / 1000.0) >= cap_sec
            });
            pulses.get() >= target || over_time_cap
        }
    };

    if !terminated {
        return Ok(TickOutcome::StillRunning);
    }

    let delivered_ml = ml_delivered(pulses.get(), pulses_per_liter);
    let requested = channel
        .as_ref()
        .map(|c| requested_ml(at.task.mode, c.nominal_flow_ml_min))
        .unwrap_or(0.0);

    valve.close(at.task.channel_id)?;
    *active = None;
    state.transition(SystemState::Idle)?;
    state.emit(SystemEvent::TaskLifecycle {
        phase: TaskPhase::Completed,
        channel: at.task.channel_id,
        requested_ml: Some(requested),
        delivered_ml: Some(delivered_ml),
        reason: None,
    });

    Ok(TickOutcome::Completed)
}

pub fn pause(
    state: &mut StateCoordinator,
    valve: &mut dyn ValvePort,
    pulses: &PulseCounter,
    active: &mut Option<ActiveTask>,
    now_epoch: i64,
) -> ControlResult<()> {
    let at = active
        .as_mut()
        .ok_or_else(|| ControlError::InvalidParam("no active task to pause".into()))?;
    valve.close(at.task.channel_id)?;
    at.elapsed_ms_at_pause = at.effective_elapsed_ms(now_epoch);
    at.pulses_at_pause = pulses.get();
    at.paused_at_epoch = now_epoch;
    state.transition(SystemState::Paused)?;
    Ok(())
}

pub fn resume(
    state: &mut StateCoordinator,
    valve: &mut dyn ValvePort,
    active: &mut Option<ActiveTask>,
    now_epoch: i64,
) -> ControlResult<()> {
    let at = active
        .as_mut()
        .ok_or_else(|| ControlError::InvalidParam("no active task to resume".into()))?;
    valve.open(at.task.channel_id)?;
    at.start_epoch = now_epoch;
    state.transition(SystemState::Watering)?;
    Ok(())
}

pub fn abort(
    channels: &ChannelStore,
    state: &mut StateCoordinator,
    valve: &mut dyn ValvePort,
    active: &mut Option<ActiveTask>,
    reason: String,
) -> ControlResult<()> {
    if let Some(at) = active.take() {
        valve.close(at.task.channel_id)?;
        let requested = channels
            .get(at.task.channel_id)
            .map(|c| requested_ml(at.task.mode, c.nominal_flow_ml_min));
        state.emit(SystemEvent::TaskLifecycle {
            phase: TaskPhase::Aborted,
            channel: at.task.channel_id,
            requested_ml: requested,
            delivered_ml: None,
            reason: Some(reason),
        });
    }
    if state.state() != SystemState::Idle {
        state.transition(SystemState::Idle)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::pulse::PulseCounter;
    use crate::task::Trigger;
    use crate::valve::SimValveBoard;

    struct NoRain;
    impl RainfallSource for NoRain {
        fn rainfall_last_hours(&self, _hours: u32) -> f32 {
            0.0
        }
    }

    fn setup() -> (ChannelStore, TaskQueue, LockManager, StateCoordinator, PulseCounter, SimValveBoard) {
        let mut channels = ChannelStore::new();
        let mut c0 = Channel::new(0, "z0");
        c0.pulses_per_liter = Some(750);
        c0.nominal_flow_ml_min = 2000.0;
        channels.set(0, c0);
        (
            channels,
            TaskQueue::default(),
            LockManager::new(),
            StateCoordinator::new(),
            PulseCounter::new(0),
            SimValveBoard::new(),
        )
    }

    // -- Starting a task -----------------------------------------------------

    #[test]
    fn starts_next_task_and_opens_valve() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        let started = try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        assert!(started);
        assert!(valve.is_open(0));
        assert_eq!(state.state(), SystemState::Watering);
    }

    #[test]
    fn no_op_when_queue_empty() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let mut active = None;
        let started = try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        assert!(!started);
    }

    #[test]
    fn no_op_when_already_active() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        state.transition(SystemState::Watering).unwrap();
        let mut active = Some(ActiveTask {
            task: Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 1 }, 0),
            start_epoch: 0,
            elapsed_ms_at_pause: 0,
            pulses_at_pause: 0,
            paused_at_epoch: 0,
        });
        let started = try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        assert!(!started);
    }

    // -- S1: volume task happy path ------------------------------------------

    #[test]
    fn s1_volume_task_completes_on_pulse_target() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();

        for _ in 0..1499 {
            pulses.increment();
        }
        let outcome = tick(&channels, &mut state, &pulses, &mut valve, &mut active, 750, 10).unwrap();
        assert!(matches!(outcome, TickOutcome::StillRunning));

        pulses.increment();
        let outcome = tick(&channels, &mut state, &pulses, &mut valve, &mut active, 750, 20).unwrap();
        assert!(matches!(outcome, TickOutcome::Completed));
        assert!(!valve.is_open(0));
        assert_eq!(state.state(), SystemState::Idle);
    }

    // -- S6: pause/resume preserves volume ------------------------------------

    #[test]
    fn s6_pause_resume_preserves_target() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();

        for _ in 0..500 {
            pulses.increment();
        }
        pause(&mut state, &mut valve, &pulses, &mut active, 10).unwrap();
        assert!(!valve.is_open(0));
        assert_eq!(state.state(), SystemState::Paused);

        resume(&mut state, &mut valve, &mut active, 70).unwrap();
        assert!(valve.is_open(0));

        for _ in 0..999 {
            pulses.increment();
        }
        let outcome = tick(&channels, &mut state, &pulses, &mut valve, &mut active, 750, 80).unwrap();
        assert!(matches!(outcome, TickOutcome::Completed));
    }

    // -- Abort --------------------------------------------------------------

    #[test]
    fn abort_closes_valve_and_returns_to_idle() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        abort(&channels, &mut state, &mut valve, &mut active, "Manual".into()).unwrap();
        assert!(!valve.is_open(0));
        assert!(active.is_none());
        assert_eq!(state.state(), SystemState::Idle);
    }

    #[test]
    fn pause_longer_than_max_auto_aborts() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByVolume { liters: 2 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        pause(&mut state, &mut valve, &pulses, &mut active, 0).unwrap();
        let outcome = tick(
            &channels,
            &mut state,
            &pulses,
            &mut valve,
            &mut active,
            750,
            PAUSE_MAX_SEC + 1,
        )
        .unwrap();
        assert!(matches!(outcome, TickOutcome::AutoAbortedPauseTimeout));
        assert!(active.is_none());
    }

    // -- Duration mode --------------------------------------------------------

    #[test]
    fn duration_task_terminates_on_timer() {
        let (mut channels, mut queue, locks, mut state, pulses, mut valve) = setup();
        let c = channels.get(0).unwrap().clone();
        queue
            .enqueue(
                Task::new(0, Trigger::Manual, TaskMode::ByDuration { minutes: 1 }, 0),
                &c,
                false,
                0,
            )
            .unwrap();
        let mut active = None;
        try_start_next(
            &mut channels, &mut queue, &locks, &mut state, &pulses, &mut valve, &mut active,
            &NoRain, 0,
        )
        .unwrap();
        let outcome = tick(&channels, &mut state, &pulses, &mut valve, &mut active, 750, 59).unwrap();
        assert!(matches!(outcome, TickOutcome::StillRunning));
        let outcome = tick(&channels, &mut state, &pulses, &mut valve, &mut active, 750, 60).unwrap();
        assert!(matches!(outcome, TickOutcome::Completed));
    }
}
