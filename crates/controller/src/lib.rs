//! Task-and-hydraulic-control engine for an 8-channel irrigation controller:
//! channel configuration, a bounded task queue, a single-active-task
//! executor, pulse-based flow verification, hydraulic locking, FAO-56
//! crop-water-balance scheduling, and SQLite-backed persistence, all wired
//! together behind [`controller::Controller`].

pub mod channel;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod executor;
pub mod fao56;
pub mod flow_monitor;
pub mod lock;
pub mod persistence;
pub mod pulse;
pub mod queue;
pub mod rain;
pub mod state;
pub mod task;
pub mod valve;

pub use controller::Controller;
pub use error::{ControlError, ControlResult};
