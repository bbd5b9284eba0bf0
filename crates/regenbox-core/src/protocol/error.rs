//! Protocol errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the box
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Port could not be configured or cloned
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// A read or write took too long
    #[error("{operation} timeout ({after:?})")]
    Timeout {
        /// "read" or "write"
        operation: &'static str,
        /// Timeout that expired
        after: Duration,
    },

    /// Transport was closed
    #[error("Serial port is closed")]
    Closed,

    /// `close` called twice
    #[error("Serial port already closed")]
    AlreadyClosed,

    /// No transport installed
    #[error("Not connected to regenbox")]
    NotConnected,

    /// Box answered with an empty line
    #[error("Message was empty")]
    EmptyResponse,

    /// Answer could not be decoded
    #[error("Invalid response from regenbox: {0}")]
    InvalidResponse(String),

    /// Slot index out of range
    #[error("No battery slot with index {0}")]
    InvalidSlot(usize),

    /// Device path does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// No port answered during a scan
    #[error("Didn't find any available serial port")]
    NoPortFound,

    /// Device I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for failures caused by the response content rather than the link
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            ProtocolError::EmptyResponse | ProtocolError::InvalidResponse(_)
        )
    }
}
