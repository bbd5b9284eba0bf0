//! Cycle engine errors

use std::time::Duration;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised by the cycle engine
#[derive(Error, Debug)]
pub enum CycleError {
    /// `start` while a session runs
    #[error("regenbox is already running")]
    AlreadyRunning,

    /// Config change while a session runs
    #[error("regenbox must be stopped first")]
    MustBeStopped,

    /// Config failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The phase ran for its whole duration without meeting its stop condition
    #[error("didn't reach target after {0:?}")]
    Timeout(Duration),

    /// The session was stopped
    #[error("stopped by user")]
    Cancelled,

    /// Nobody drained the snapshot stream in time
    #[error("snapshot consumer stalled for {0:?}")]
    BackPressure(Duration),

    /// Driver failure
    #[error(transparent)]
    Device(#[from] ProtocolError),
}
