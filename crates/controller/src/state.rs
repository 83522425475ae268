//! State coordinator (C11): system state/status/power mode and the
//! broadcast event stream consumed by external collaborators (console,
//! BLE bridge, anything else that wants to observe the controller).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ControlError;
use crate::task::TaskMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    Idle,
    Watering,
    Paused,
    ErrorRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Ok,
    Fault,
    NoFlow,
    UnexpectedFlow,
    Locked,
    LowPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerMode {
    Normal,
    EnergySaving,
    UltraLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    Channel(u8),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Started,
    Completed,
    Aborted,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemEvent {
    SystemStatusChanged {
        status: SystemStatus,
    },
    TaskLifecycle {
        phase: TaskPhase,
        channel: u8,
        requested_ml: Option<f64>,
        delivered_ml: Option<f64>,
        reason: Option<String>,
    },
    FlowUpdate {
        cumulative_pulses: u32,
    },
    HydraulicLockChanged {
        scope: LockScope,
        level: crate::channel::LockLevel,
        reason: Option<String>,
        retry_after_epoch: i64,
    },
    ConstraintApplied {
        channel: u8,
        calculated_l: f64,
        capped_l: f64,
        mode: &'static str,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct StateCoordinator {
    state: SystemState,
    status: SystemStatus,
    power_mode: PowerMode,
    events: broadcast::Sender<SystemEvent>,
}

impl StateCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: SystemState::Idle,
            status: SystemStatus::Ok,
            power_mode: PowerMode::Normal,
            events: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn status(&self) -> SystemStatus {
        self.status
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn emit(&self, event: SystemEvent) {
        // No subscribers is a normal condition (nobody's listening yet); the
        // core never blocks or errors on a quiet event bus.
        let _ = self.events.send(event);
    }

    /// Only these §4.5 transitions are legal.
    pub fn transition(&mut self, to: SystemState) -> Result<(), ControlError> {
        use SystemState::*;
        let legal = matches!(
            (self.state, to),
            (Idle, Watering)
                | (Watering, Idle)
                | (Watering, Paused)
                | (Paused, Watering)
                | (Paused, Idle)
                | (_, ErrorRecovery)
                | (ErrorRecovery, Idle)
        );
        if !legal {
            return Err(ControlError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Sets status unless the system is already `Fault`, which is sticky
    /// until an explicit operator reset (§4.11/§7).
    pub fn set_status_unless_fault(&mut self, status: SystemStatus) {
        if self.status == SystemStatus::Fault {
            return;
        }
        if self.status != status {
            self.status = status;
            self.emit(SystemEvent::SystemStatusChanged { status });
        }
    }

    /// Forces `Fault`, bypassing the sticky guard (used to *enter* fault).
    pub fn force_fault(&mut self) {
        if self.status != SystemStatus::Fault {
            self.status = SystemStatus::Fault;
            self.emit(SystemEvent::SystemStatusChanged {
                status: SystemStatus::Fault,
            });
        }
    }

    /// Operator reset: clears fault status back to `Ok`. Does not touch
    /// `system_state`; the caller is responsible for transitioning state and
    /// invoking `close_all` first.
    pub fn reset_fault(&mut self) {
        self.status = SystemStatus::Ok;
        self.emit(SystemEvent::SystemStatusChanged {
            status: SystemStatus::Ok,
        });
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), ControlError> {
        if mode == PowerMode::UltraLow && self.state == SystemState::Watering {
            return Err(ControlError::InvalidParam(
                "cannot enter UltraLow power mode while watering".to_string(),
            ));
        }
        self.power_mode = mode;
        Ok(())
    }
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn requested_ml(mode: TaskMode, nominal_flow_ml_min: f32) -> f64 {
    match mode {
        TaskMode::ByVolume { liters } => liters as f64 * 1000.0,
        TaskMode::ByDuration { minutes } => minutes as f64 * nominal_flow_ml_min as f64,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
