//! Controller (C14): the process-entry-point struct that owns every
//! component behind the single "system mutex" (§5) and drives the
//! tick-based core from a supervised background task, the same
//! `tokio::select!`-over-critical-vs-non-critical-handles shape this
//! codebase's hub process uses for its MQTT/watchdog/scheduler tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelStore, LockLevel, LockReason};
use crate::env::{now_unix, EnvPort, EnvSample};
use crate::error::{ControlError, ControlResult};
use crate::executor::{self, ActiveTask};
use crate::fao56::{self, PlantProfile};
use crate::flow_monitor::{self, MonitorState};
use crate::lock::LockManager;
use crate::persistence::{AutoCalcSettings, FlowCalibration, Store, TaskHistoryRow};
use crate::pulse::PulseCounter;
use crate::queue::TaskQueue;
use crate::rain::RainfallSource;
use crate::state::{PowerMode, StateCoordinator, SystemEvent, SystemState, SystemStatus};
use crate::task::{Task, TaskMode, Trigger};
use crate::valve::ValvePort;

/// Safety timeout for the implicit Manual task created by `channel_on`.
const MANUAL_TOGGLE_SAFETY_MINUTES: u16 = 60;

/// Core tick interval driving the executor / flow monitor / lock sweep.
const CORE_TICK_MS: u64 = 1_000;

struct Inner {
    channels: ChannelStore,
    queue: TaskQueue,
    locks: LockManager,
    state: StateCoordinator,
    active: Option<ActiveTask>,
    monitor: MonitorState,
    flow_calibration_pulses_per_liter: u32,
    auto_calc_interval_hours: u32,
    auto_calc_enabled: bool,
    valve: Box<dyn ValvePort>,
    env: Box<dyn EnvPort>,
    last_env_sample: Option<EnvSample>,
}

/// Flat adapter exposing the environment reader's single 24h rainfall
/// figure through the rain-compensation module's hourly-lookback trait.
struct SampledRainfall {
    rain_mm_24h: f32,
}

impl RainfallSource for SampledRainfall {
    fn rainfall_last_hours(&self, hours: u32) -> f32 {
        self.rain_mm_24h * (hours.min(24) as f32 / 24.0)
    }
}

pub struct Controller {
    inner: Mutex<Inner>,
    pulses: Arc<PulseCounter>,
    store: Arc<dyn Store>,
}

impl Controller {
    pub async fn new(
        valve: Box<dyn ValvePort>,
        env: Box<dyn EnvPort>,
        store: Arc<dyn Store>,
        pulses: Arc<PulseCounter>,
    ) -> anyhow::Result<Arc<Self>> {
        let persisted_channels = store.load_channels().await?;
        let mut channels = ChannelStore::new();
        for c in persisted_channels {
            channels.set(c.id, c);
        }

        let global_lock = store.load_global_lock().await?;
        let flow_calibration_pulses_per_liter = store
            .load_flow_calibration()
            .await?
            .map(|c| c.pulses_per_liter)
            .unwrap_or(450);
        let AutoCalcSettings { interval_hours: auto_calc_interval_hours, enabled: auto_calc_enabled } =
            store
                .load_auto_calc_settings()
                .await?
                .unwrap_or(AutoCalcSettings { interval_hours: 1, enabled: true });

        let mut locks = LockManager::new();
        let mut state = StateCoordinator::new();
        if let Some(gl) = global_lock {
            if gl.level != LockLevel::None {
                locks.set_global(
                    gl.level,
                    gl.reason.unwrap_or(LockReason::Other("restored".into())),
                    gl.locked_at_epoch,
                    gl.retry_after_epoch,
                    &mut state,
                );
            }
        }

        let inner = Inner {
            channels,
            queue: TaskQueue::default(),
            locks,
            state,
            active: None,
            monitor: MonitorState::default(),
            flow_calibration_pulses_per_liter,
            auto_calc_interval_hours,
            auto_calc_enabled,
            valve,
            env,
            last_env_sample: None,
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            pulses,
            store,
        }))
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.lock().await.state.subscribe()
    }

    // -- Commands (§6) --------------------------------------------------

    pub async fn enqueue_task(&self, channel_id: u8, mode: TaskMode) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let channel = inner
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ControlError::InvalidParam(format!("unknown channel {channel_id}")))?;
        let manual_override = inner.locks.is_manual_override_active(channel_id, now);
        inner
            .queue
            .enqueue(Task::new(channel_id, Trigger::RemoteCommand, mode, now), &channel, manual_override, now)
    }

    pub async fn stop_current(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        let Inner { channels, state, valve, active, .. } = &mut *inner;
        executor::abort(channels, state, valve.as_mut(), active, "Manual".to_string())
    }

    pub async fn clear_queue(&self) -> usize {
        self.inner.lock().await.queue.clear()
    }

    pub async fn pause(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let Inner { state, valve, active, .. } = &mut *inner;
        executor::pause(state, valve.as_mut(), &self.pulses, active, now)
    }

    pub async fn resume(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let Inner { state, valve, active, .. } = &mut *inner;
        executor::resume(state, valve.as_mut(), active, now)
    }

    /// Immediate manual toggle: opens a channel via an implicit, bounded
    /// duration Manual task so it still goes through the single-active-task
    /// invariant instead of driving the valve port directly.
    pub async fn channel_on(&self, channel_id: u8) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let channel = inner
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ControlError::InvalidParam(format!("unknown channel {channel_id}")))?;
        let manual_override = inner.locks.is_manual_override_active(channel_id, now);
        inner.queue.enqueue(
            Task::new(
                channel_id,
                Trigger::Manual,
                TaskMode::ByDuration { minutes: MANUAL_TOGGLE_SAFETY_MINUTES },
                now,
            ),
            &channel,
            manual_override,
            now,
        )?;
        let Inner { channels, queue, locks, state, valve, active, .. } = &mut *inner;
        executor::try_start_next(
            channels, queue, locks, state, &self.pulses, valve.as_mut(), active,
            &SampledRainfall { rain_mm_24h: 0.0 }, now,
        )?;
        Ok(())
    }

    pub async fn channel_off(&self, channel_id: u8) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.active.as_ref().map(|a| a.task.channel_id) != Some(channel_id) {
            return Ok(());
        }
        let Inner { channels, state, valve, active, .. } = &mut *inner;
        executor::abort(channels, state, valve.as_mut(), active, "Manual".to_string())
    }

    pub async fn set_channel_config(&self, channel: Channel) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        self.store.save_channel(&channel).await?;
        inner.channels.set(channel.id, channel);
        Ok(())
    }

    pub async fn get_channel_config(&self, channel_id: u8) -> Option<Channel> {
        self.inner.lock().await.channels.get(channel_id).cloned()
    }

    pub async fn set_flow_calibration(&self, pulses_per_liter: u32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        self.store
            .save_flow_calibration(&FlowCalibration { pulses_per_liter })
            .await?;
        inner.flow_calibration_pulses_per_liter = pulses_per_liter;
        Ok(())
    }

    pub async fn get_flow_calibration(&self) -> u32 {
        self.inner.lock().await.flow_calibration_pulses_per_liter
    }

    pub async fn set_power_mode(&self, mode: PowerMode) -> ControlResult<()> {
        self.inner.lock().await.state.set_power_mode(mode)
    }

    /// Operator reset: clears `Fault`, resets the no-flow attempt counter,
    /// and closes all valves (§4.11).
    pub async fn clear_errors(&self) {
        let mut inner = self.inner.lock().await;
        inner.monitor = MonitorState::default();
        inner.valve.close_all();
        inner.active = None;
        inner.state.reset_fault();
        if inner.state.state() != SystemState::Idle {
            let _ = inner.state.transition(SystemState::Idle);
        }
    }

    pub async fn reset_fault(&self) {
        self.clear_errors().await;
    }

    pub async fn hydraulic_set_channel_lock(
        &self,
        channel_id: u8,
        level: LockLevel,
        reason: LockReason,
        retry_after_epoch: i64,
    ) {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let Inner { channels, locks, state, .. } = &mut *inner;
        locks.set_channel(channels, channel_id, level, reason, now, retry_after_epoch, state);
    }

    pub async fn hydraulic_clear_channel_lock(&self, channel_id: u8) {
        let mut inner = self.inner.lock().await;
        let Inner { channels, locks, state, .. } = &mut *inner;
        locks.clear_channel(channels, channel_id, state);
    }

    pub async fn hydraulic_set_global_lock(
        &self,
        level: LockLevel,
        reason: LockReason,
        retry_after_epoch: i64,
    ) {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let Inner { locks, state, .. } = &mut *inner;
        locks.set_global(level, reason, now, retry_after_epoch, state);
        let snapshot = locks.global().clone();
        if let Err(e) = self.store.save_global_lock(&snapshot).await {
            error!("failed to persist global lock: {e:#}");
        }
    }

    pub async fn hydraulic_clear_global_lock(&self) {
        let mut inner = self.inner.lock().await;
        let Inner { locks, state, .. } = &mut *inner;
        locks.clear_global(state);
        let snapshot = locks.global().clone();
        if let Err(e) = self.store.save_global_lock(&snapshot).await {
            error!("failed to persist global lock: {e:#}");
        }
    }

    pub async fn hydraulic_manual_override(&self, channel_id: u8, duration_ms: u64) {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        inner.locks.manual_override(channel_id, duration_ms, now);
    }

    pub async fn auto_calc_set_interval(&self, hours: u32) -> ControlResult<()> {
        if !(1..=24).contains(&hours) {
            return Err(ControlError::InvalidParam(format!(
                "auto_calc interval {hours}h out of range 1..=24"
            )));
        }
        let mut inner = self.inner.lock().await;
        inner.auto_calc_interval_hours = hours;
        let settings = AutoCalcSettings { interval_hours: hours, enabled: inner.auto_calc_enabled };
        if let Err(e) = self.store.save_auto_calc_settings(&settings).await {
            error!("failed to persist auto-calc interval: {e:#}");
        }
        Ok(())
    }

    pub async fn auto_calc_set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        inner.auto_calc_enabled = enabled;
        let settings = AutoCalcSettings { interval_hours: inner.auto_calc_interval_hours, enabled };
        if let Err(e) = self.store.save_auto_calc_settings(&settings).await {
            error!("failed to persist auto-calc enabled flag: {e:#}");
        }
    }

    pub async fn system_state(&self) -> SystemState {
        self.inner.lock().await.state.state()
    }

    pub async fn system_status(&self) -> SystemStatus {
        self.inner.lock().await.state.status()
    }

    // -- Background ticks ------------------------------------------------

    /// One core tick: lock sweep, flow monitor, executor termination check,
    /// start-next. Called every `CORE_TICK_MS` with the mutex held for the
    /// whole step, mirroring §5's "short critical sections" guidance scaled
    /// to this crate's simpler single-consumer tick loop.
    async fn core_tick(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();

        {
            let Inner { channels, locks, state, .. } = &mut *inner;
            locks.tick(channels, now, state);
        }

        {
            let Inner { monitor, channels, locks, state, valve, active, .. } = &mut *inner;
            flow_monitor::tick(monitor, channels, locks, state, &self.pulses, valve.as_mut(), active, now);
        }

        if inner.state.state() == SystemState::Watering {
            let cal = inner.flow_calibration_pulses_per_liter;
            let Inner { channels, state, valve, active, .. } = &mut *inner;
            executor::tick(channels, state, &self.pulses, valve.as_mut(), active, cal, now)?;
        }

        if inner.active.is_none() {
            let rainfall = SampledRainfall {
                rain_mm_24h: inner.last_env_sample.map(|s| s.rain_mm_24h as f32).unwrap_or(0.0),
            };
            let Inner { channels, queue, locks, state, valve, active, .. } = &mut *inner;
            executor::try_start_next(
                channels, queue, locks, state, &self.pulses, valve.as_mut(), active, &rainfall, now,
            )?;
        }

        if let Some(count) = self.pulses.notify_if_due() {
            inner.state.emit(SystemEvent::FlowUpdate { cumulative_pulses: count });
        }

        Ok(())
    }

    async fn auto_calc_tick(&self, day_of_year: u32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.auto_calc_enabled {
            return Ok(());
        }
        let now = now_unix();
        let sample = inner.env.sample();
        inner.last_env_sample = Some(sample);

        let active_channel = inner.active.as_ref().map(|a| a.task.channel_id);
        let Inner { channels, queue, state, .. } = &mut *inner;
        let outcomes = fao56::run_once(
            channels,
            queue,
            &sample,
            |_ch| PlantProfile::default_lawn(),
            active_channel,
            now,
            day_of_year,
            state,
        );
        if !outcomes.is_empty() {
            info!(scheduled = outcomes.len(), "auto-calc pass produced schedule outcomes");
        }
        Ok(())
    }

    async fn record_lifecycle_event(&self, event: &SystemEvent) {
        if let SystemEvent::TaskLifecycle { phase, channel, requested_ml, delivered_ml, reason } = event {
            let row = TaskHistoryRow {
                ts: now_unix(),
                channel_id: *channel,
                phase: format!("{phase:?}"),
                requested_ml: *requested_ml,
                delivered_ml: *delivered_ml,
                reason: reason.clone(),
            };
            if let Err(e) = self.store.append_task_history(&row).await {
                error!("append_task_history failed: {e:#}");
            }
        }
    }

    /// Runs the supervised background loop until a shutdown signal fires.
    /// Spawns the core tick, the auto-scheduler tick, and a history-writer
    /// fed by the event bus, then `tokio::select!`s over them exactly like
    /// this codebase's hub process does for its watchdog/scheduler tasks —
    /// a core-tick death is critical and ends the process; history writing
    /// is not.
    pub async fn run_supervised(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let core_self = Arc::clone(&self);
        let mut core_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(CORE_TICK_MS));
            loop {
                ticker.tick().await;
                if let Err(e) = core_self.core_tick().await {
                    error!("core tick failed: {e:#}");
                }
            }
        });

        let auto_self = Arc::clone(&self);
        let mut auto_handle = tokio::spawn(async move {
            let interval_hours = { auto_self.inner.lock().await.auto_calc_interval_hours };
            let mut ticker = interval(Duration::from_secs(interval_hours.max(1) as u64 * 3600));
            loop {
                ticker.tick().await;
                let day_of_year = day_of_year_now();
                if let Err(e) = auto_self.auto_calc_tick(day_of_year).await {
                    error!("auto-calc tick failed: {e:#}");
                }
            }
        });

        let history_self = Arc::clone(&self);
        let mut rx = self.subscribe().await;
        let mut history_handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => history_self.record_lifecycle_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "history writer lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio::select! {
            result = &mut core_handle => {
                error!("CRITICAL: core tick task exited unexpectedly: {result:?}");
            }
            result = &mut auto_handle => {
                warn!("auto-calc task exited unexpectedly: {result:?}");
            }
            result = &mut history_handle => {
                warn!("history writer task exited unexpectedly: {result:?}");
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
            }
        }

        core_handle.abort();
        auto_handle.abort();
        history_handle.abort();

        let mut inner = self.inner.lock().await;
        inner.valve.close_all();
        info!("controller shut down, all valves closed");
    }
}

fn day_of_year_now() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((secs / 86_400) % 365) as u32 + 1
}

// ===========================================================================
// Tests
// ===========================================================================
