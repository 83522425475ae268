//! Typed error taxonomy for the public control API.
//!
//! Internal plumbing (config parsing, persistence IO) uses `anyhow` with
//! `.context(...)` chains; at the API boundary those get folded into one of
//! the variants below so callers see a small, stable error surface.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("component not initialized: {0}")]
    NotInitialized(String),

    #[error("system busy, try again")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("hardware fault: {0}")]
    Hardware(String),

    #[error("no flow detected on channel {channel}")]
    NoFlow { channel: u8 },

    #[error("unexpected flow detected")]
    UnexpectedFlow,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("channel {channel} locked, retry after {retry_after_epoch}")]
    Locked { channel: u8, retry_after_epoch: i64 },

    #[error("global hydraulic lock engaged, retry after {retry_after_epoch}")]
    GlobalLocked { retry_after_epoch: i64 },

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("illegal state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("system fault: {0}")]
    Fault(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<anyhow::Error> for ControlError {
    fn from(e: anyhow::Error) -> Self {
        ControlError::Storage(e.to_string())
    }
}
