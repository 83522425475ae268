//! Task record shared between the queue (C4) and the executor (C5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Manual,
    Scheduled,
    RemoteCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TaskMode {
    ByDuration { minutes: u16 },
    ByVolume { liters: u16 },
}

impl TaskMode {
    pub fn validate(&self) -> Result<(), crate::error::ControlError> {
        match self {
            TaskMode::ByDuration { minutes } => {
                if *minutes == 0 || *minutes > 720 {
                    return Err(crate::error::ControlError::InvalidParam(format!(
                        "duration {minutes} minutes out of range 1..=720"
                    )));
                }
            }
            TaskMode::ByVolume { liters } => {
                if *liters == 0 {
                    return Err(crate::error::ControlError::InvalidParam(
                        "volume must be >= 1 liter".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A single request to water one channel, carrying only the channel id
/// (never a pointer back into the store) so the queue has no lifetime
/// entanglement with channel records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub channel_id: u8,
    pub trigger: Trigger,
    pub mode: TaskMode,
    pub enqueue_epoch: i64,
}

impl Task {
    pub fn new(channel_id: u8, trigger: Trigger, mode: TaskMode, enqueue_epoch: i64) -> Self {
        Self {
            channel_id,
            trigger,
            mode,
            enqueue_epoch,
        }
    }
}
