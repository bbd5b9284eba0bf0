//! Serial Protocol Communication
//!
//! Implements the regenbox byte protocol: one command byte out, one
//! newline-terminated line back.

pub mod commands;
mod error;
pub mod serial;
mod transport;

pub use commands::{Command, Response, ResponseKind, SLOT_COUNT};
pub use error::ProtocolError;
pub use serial::{list_ports, open_port, PortInfo};
pub use transport::{DeviceReader, DeviceWriter, Transport, TransportConfig};

/// Default baud rate of the box firmware
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default timeout for reads and writes in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// OS-level read timeout on the serial handle in milliseconds
pub const PORT_READ_TIMEOUT_MS: u64 = 50;

/// Longest response line accepted before it is discarded
pub const MAX_LINE_LEN: usize = 256;
