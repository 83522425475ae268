//! Task queue (C4): bounded FIFO of pending tasks, plus the single
//! "current active task" slot owned by the executor.

use std::collections::VecDeque;

use crate::channel::{Channel, NUM_CHANNELS};
use crate::error::ControlError;
use crate::task::Task;

pub const DEFAULT_CAPACITY: usize = 16;

pub struct TaskQueue {
    pending: VecDeque<Task>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueues `task` for `channel`. `manual_override_active` bypasses a
    /// Soft lock but never a Hard lock (§4.4).
    pub fn enqueue(
        &mut self,
        task: Task,
        channel: &Channel,
        manual_override_active: bool,
        now_epoch: i64,
    ) -> Result<(), ControlError> {
        if (task.channel_id as usize) >= NUM_CHANNELS || channel.id != task.channel_id {
            return Err(ControlError::InvalidParam(format!(
                "invalid channel id {}",
                task.channel_id
            )));
        }

        task.mode
            .validate()
            .map_err(|_| ControlError::InvalidParam("invalid task mode".to_string()))?;

        use crate::channel::LockLevel;
        match channel.lock.level {
            LockLevel::Hard => {
                return Err(ControlError::Locked {
                    channel: channel.id,
                    retry_after_epoch: channel.lock.retry_after_epoch,
                });
            }
            LockLevel::Soft if !manual_override_active && now_epoch < channel.lock.retry_after_epoch => {
                return Err(ControlError::Locked {
                    channel: channel.id,
                    retry_after_epoch: channel.lock.retry_after_epoch,
                });
            }
            _ => {}
        }

        if self.pending.len() >= self.capacity {
            return Err(ControlError::Busy);
        }

        self.pending.push_back(task);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    /// Drops all pending tasks, returning the count dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn peek_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending_for(&self, channel_id: u8) -> bool {
        self.pending.iter().any(|t| t.channel_id == channel_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, HydraulicLock, LockLevel, LockReason};
    use crate::task::{TaskMode, Trigger};

    fn task(channel_id: u8) -> Task {
        Task::new(
            channel_id,
            Trigger::Manual,
            TaskMode::ByVolume { liters: 2 },
            1_700_000_000,
        )
    }

    // -- FIFO order / round trip ----------------------------------------

    #[test]
    fn enqueue_then_dequeue_preserves_task() {
        let mut q = TaskQueue::default();
        let c = Channel::new(0, "z");
        let t = task(0);
        q.enqueue(t, &c, false, 0).unwrap();
        let out = q.dequeue().unwrap();
        assert_eq!(out.channel_id, t.channel_id);
        assert_eq!(out.mode, t.mode);
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = TaskQueue::default();
        let c0 = Channel::new(0, "z0");
        let c1 = Channel::new(1, "z1");
        q.enqueue(task(0), &c0, false, 0).unwrap();
        q.enqueue(task(1), &c1, false, 0).unwrap();
        assert_eq!(q.dequeue().unwrap().channel_id, 0);
        assert_eq!(q.dequeue().unwrap().channel_id, 1);
    }

    #[test]
    fn dequeue_on_empty_is_none() {
        let mut q = TaskQueue::default();
        assert!(q.dequeue().is_none());
    }

    // -- Capacity ----------------------------------------------------------

    #[test]
    fn full_queue_rejects_enqueue() {
        let mut q = TaskQueue::new(2);
        let c = Channel::new(0, "z");
        q.enqueue(task(0), &c, false, 0).unwrap();
        q.enqueue(task(0), &c, false, 0).unwrap();
        assert!(matches!(
            q.enqueue(task(0), &c, false, 0),
            Err(ControlError::Busy)
        ));
    }

    #[test]
    fn default_capacity_is_at_least_sixteen() {
        assert!(DEFAULT_CAPACITY >= 16);
    }

    // -- Lock enforcement ------------------------------------------------

    #[test]
    fn hard_locked_channel_rejects_enqueue() {
        let mut q = TaskQueue::default();
        let mut c = Channel::new(0, "z");
        c.lock = HydraulicLock {
            level: LockLevel::Hard,
            reason: Some(LockReason::Operator),
            locked_at_epoch: 0,
            retry_after_epoch: 0,
        };
        assert!(matches!(
            q.enqueue(task(0), &c, false, 0),
            Err(ControlError::Locked { .. })
        ));
    }

    #[test]
    fn soft_locked_channel_rejects_before_retry() {
        let mut q = TaskQueue::default();
        let mut c = Channel::new(0, "z");
        c.lock = HydraulicLock {
            level: LockLevel::Soft,
            reason: Some(LockReason::NoFlow),
            locked_at_epoch: 0,
            retry_after_epoch: 1000,
        };
        assert!(matches!(
            q.enqueue(task(0), &c, false, 500),
            Err(ControlError::Locked { .. })
        ));
    }

    #[test]
    fn soft_locked_channel_accepts_after_retry() {
        let mut q = TaskQueue::default();
        let mut c = Channel::new(0, "z");
        c.lock = HydraulicLock {
            level: LockLevel::Soft,
            reason: Some(LockReason::NoFlow),
            locked_at_epoch: 0,
            retry_after_epoch: 1000,
        };
        assert!(q.enqueue(task(0), &c, false, 1000).is_ok());
    }

    #[test]
    fn manual_override_bypasses_soft_lock() {
        let mut q = TaskQueue::default();
        let mut c = Channel::new(0, "z");
        c.lock = HydraulicLock {
            level: LockLevel::Soft,
            reason: Some(LockReason::NoFlow),
            locked_at_epoch: 0,
            retry_after_epoch: 1000,
        };
        assert!(q.enqueue(task(0), &c, true, 0).is_ok());
    }

    #[test]
    fn manual_override_does_not_bypass_hard_lock() {
        let mut q = TaskQueue::default();
        let mut c = Channel::new(0, "z");
        c.lock = HydraulicLock {
            level: LockLevel::Hard,
            reason: Some(LockReason::Operator),
            locked_at_epoch: 0,
            retry_after_epoch: 0,
        };
        assert!(matches!(
            q.enqueue(task(0), &c, true, 0),
            Err(ControlError::Locked { .. })
        ));
    }

    #[test]
    fn mismatched_channel_id_rejected() {
        let mut q = TaskQueue::default();
        let c = Channel::new(1, "z");
        assert!(matches!(
            q.enqueue(task(0), &c, false, 0),
            Err(ControlError::InvalidParam(_))
        ));
    }

    // -- clear / peek --------------------------------------------------------

    #[test]
    fn clear_reports_dropped_count() {
        let mut q = TaskQueue::default();
        let c = Channel::new(0, "z");
        q.enqueue(task(0), &c, false, 0).unwrap();
        q.enqueue(task(0), &c, false, 0).unwrap();
        assert_eq!(q.clear(), 2);
        assert_eq!(q.peek_pending(), 0);
    }

    #[test]
    fn has_pending_for_checks_channel() {
        let mut q = TaskQueue::default();
        let c = Channel::new(3, "z");
        q.enqueue(task(3), &c, false, 0).unwrap();
        assert!(q.has_pending_for(3));
        assert!(!q.has_pending_for(4));
    }
}
