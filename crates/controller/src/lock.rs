//! Hydraulic lock manager (C7): per-channel and global SOFT/HARD locks,
//! plus the bounded manual-override window.

use crate::channel::{ChannelStore, HydraulicLock, LockLevel, LockReason};
use crate::state::{LockScope, StateCoordinator, SystemEvent, SystemStatus};

pub const DEFAULT_SOFT_LOCK_RETRY_SEC: i64 = 300;
pub const NO_FLOW_RETRY_COOLDOWN_SEC: i64 = 600;

struct ManualOverride {
    channel_id: u8,
    expires_epoch: i64,
}

pub struct LockManager {
    global: HydraulicLock,
    manual_override: Option<ManualOverride>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            global: HydraulicLock::none(),
            manual_override: None,
        }
    }

    pub fn global(&self) -> &HydraulicLock {
        &self.global
    }

    pub fn is_manual_override_active(&self, channel_id: u8, now_epoch: i64) -> bool {
        self.manual_override
            .as_ref()
            .map(|o| o.channel_id == channel_id && now_epoch < o.expires_epoch)
            .unwrap_or(false)
    }

    pub fn manual_override(&mut self, channel_id: u8, duration_ms: u64, now_epoch: i64) {
        self.manual_override = Some(ManualOverride {
            channel_id,
            expires_epoch: now_epoch + (duration_ms / 1000) as i64,
        });
    }

    pub fn clear_override(&mut self) {
        self.manual_override = None;
    }

    pub fn set_global(
        &mut self,
        level: LockLevel,
        reason: LockReason,
        now_epoch: i64,
        retry_after_epoch: i64,
        state: &mut StateCoordinator,
    ) {
        self.global = HydraulicLock {
            level,
            reason: Some(reason.clone()),
            locked_at_epoch: now_epoch,
            retry_after_epoch,
        };
        state.emit(SystemEvent::HydraulicLockChanged {
            scope: LockScope::Global,
            level,
            reason: Some(format!("{reason:?}")),
            retry_after_epoch,
        });
        if level != LockLevel::None {
            state.set_status_unless_fault(SystemStatus::Locked);
        }
    }

    pub fn clear_global(&mut self, state: &mut StateCoordinator) {
        self.global = HydraulicLock::none();
        state.emit(SystemEvent::HydraulicLockChanged {
            scope: LockScope::Global,
            level: LockLevel::None,
            reason: None,
            retry_after_epoch: 0,
        });
        state.set_status_unless_fault(SystemStatus::Ok);
    }

    pub fn set_channel(
        &self,
        store: &mut ChannelStore,
        id: u8,
        level: LockLevel,
        reason: LockReason,
        now_epoch: i64,
        retry_after_epoch: i64,
        state: &mut StateCoordinator,
    ) {
        if let Some(ch) = store.get_mut(id) {
            ch.lock = HydraulicLock {
                level,
                reason: Some(reason.clone()),
                locked_at_epoch: now_epoch,
                retry_after_epoch,
            };
            state.emit(SystemEvent::HydraulicLockChanged {
                scope: LockScope::Channel(id),
                level,
                reason: Some(format!("{reason:?}")),
                retry_after_epoch,
            });
        }
    }

    pub fn clear_channel(&self, store: &mut ChannelStore, id: u8, state: &mut StateCoordinator) {
        if let Some(ch) = store.get_mut(id) {
            ch.lock = HydraulicLock::none();
            state.emit(SystemEvent::HydraulicLockChanged {
                scope: LockScope::Channel(id),
                level: LockLevel::None,
                reason: None,
                retry_after_epoch: 0,
            });
        }
    }

    /// Scans all Soft locks (per-channel and global) and clears the ones
    /// whose retry deadline has passed.
    pub fn tick(&mut self, store: &mut ChannelStore, now_epoch: i64, state: &mut StateCoordinator) {
        if self.global.level == LockLevel::Soft && now_epoch >= self.global.retry_after_epoch {
            self.clear_global(state);
        }
        for ch in store.all_mut() {
            if ch.lock.level == LockLevel::Soft && now_epoch >= ch.lock.retry_after_epoch {
                ch.lock = HydraulicLock::none();
                state.emit(SystemEvent::HydraulicLockChanged {
                    scope: LockScope::Channel(ch.id),
                    level: LockLevel::None,
                    reason: None,
                    retry_after_epoch: 0,
                });
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
