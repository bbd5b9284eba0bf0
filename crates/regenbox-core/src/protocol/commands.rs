//! Protocol commands
//!
//! Every exchange is one command byte out and one line back. The byte values
//! match the box firmware and must not be renumbered.

use serde::{Deserialize, Serialize};

use super::ProtocolError;
use crate::driver::ChargeState;

/// Single-byte commands understood by the box firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe
    Ping,
    /// Raw ADC reading of pin A0
    ReadAnalog,
    /// Battery voltage of slot 1 in mV
    ReadVoltage1,
    /// Battery voltage of slot 2 in mV
    ReadVoltage2,
    /// Battery voltage of slot 3 in mV
    ReadVoltage3,
    /// Battery voltage of slot 4 in mV
    ReadVoltage4,
    /// Firmware identifier
    ReadFirmware,
    /// Turn the LED off
    LedOff,
    /// Turn the LED on
    LedOn,
    /// Toggle the LED, answers with its new state
    LedToggle,
    /// Release the discharge pin
    DischargeOff,
    /// Drive the discharge pin
    DischargeOn,
    /// Release the charge pin
    ChargeOff,
    /// Drive the charge pin
    ChargeOn,
    /// Enter idle mode
    ModeIdle,
    /// Enter charge mode
    ModeCharge,
    /// Enter discharge mode
    ModeDischarge,
    /// Enter four-battery charge mode
    ModeChargeX4,
}

/// Shape of the line the box answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Any non-empty line
    Ack,
    /// ASCII decimal integer
    Integer,
    /// One byte, 1 for on and 0 for off
    Bool,
    /// Free text
    Text,
}

/// Number of addressable battery slots
pub const SLOT_COUNT: usize = 4;

const ALL_COMMANDS: [Command; 18] = [
    Command::Ping,
    Command::ReadAnalog,
    Command::ReadVoltage1,
    Command::ReadVoltage2,
    Command::ReadVoltage3,
    Command::ReadVoltage4,
    Command::ReadFirmware,
    Command::LedOff,
    Command::LedOn,
    Command::LedToggle,
    Command::DischargeOff,
    Command::DischargeOn,
    Command::ChargeOff,
    Command::ChargeOn,
    Command::ModeIdle,
    Command::ModeCharge,
    Command::ModeDischarge,
    Command::ModeChargeX4,
];

/// Mode commands and the charge state each one puts the box in.
const MODE_TABLE: [(Command, ChargeState); 4] = [
    (Command::ModeIdle, ChargeState::Idle),
    (Command::ModeCharge, ChargeState::Charging),
    (Command::ModeDischarge, ChargeState::Discharging),
    (Command::ModeChargeX4, ChargeState::ChargingX4),
];

impl Command {
    /// Get the wire byte for this command
    pub fn byte(&self) -> u8 {
        match self {
            Command::Ping => 0xa0,
            Command::ReadAnalog => 0x00,
            Command::ReadVoltage1 => 0x01,
            Command::ReadFirmware => 0x02,
            Command::ReadVoltage2 => 0x03,
            Command::ReadVoltage3 => 0x04,
            Command::ReadVoltage4 => 0x05,
            Command::LedOff => 0x10,
            Command::LedOn => 0x11,
            Command::LedToggle => 0x12,
            Command::DischargeOff => 0x20,
            Command::DischargeOn => 0x21,
            Command::ChargeOff => 0x30,
            Command::ChargeOn => 0x31,
            Command::ModeIdle => 0x50,
            Command::ModeCharge => 0x51,
            Command::ModeDischarge => 0x52,
            Command::ModeChargeX4 => 0x53,
        }
    }

    /// Decode a wire byte
    pub fn from_byte(byte: u8) -> Option<Command> {
        ALL_COMMANDS.iter().copied().find(|c| c.byte() == byte)
    }

    /// All commands in wire order of their groups
    pub fn all() -> &'static [Command] {
        &ALL_COMMANDS
    }

    /// Voltage read command for a zero-based battery slot
    pub fn read_voltage(slot: usize) -> Option<Command> {
        match slot {
            0 => Some(Command::ReadVoltage1),
            1 => Some(Command::ReadVoltage2),
            2 => Some(Command::ReadVoltage3),
            3 => Some(Command::ReadVoltage4),
            _ => None,
        }
    }

    /// Zero-based slot addressed by a voltage read command
    pub fn voltage_slot(&self) -> Option<usize> {
        match self {
            Command::ReadVoltage1 => Some(0),
            Command::ReadVoltage2 => Some(1),
            Command::ReadVoltage3 => Some(2),
            Command::ReadVoltage4 => Some(3),
            _ => None,
        }
    }

    /// Mode command that puts the box in `state`
    pub fn for_charge_state(state: ChargeState) -> Command {
        MODE_TABLE
            .iter()
            .find(|(_, s)| *s == state)
            .map(|(c, _)| *c)
            .unwrap_or(Command::ModeIdle)
    }

    /// Charge state reached once this mode command is acknowledged
    pub fn charge_state(&self) -> Option<ChargeState> {
        MODE_TABLE
            .iter()
            .find(|(c, _)| c == self)
            .map(|(_, s)| *s)
    }

    /// Expected response shape
    pub fn response(&self) -> ResponseKind {
        match self {
            Command::ReadAnalog
            | Command::ReadVoltage1
            | Command::ReadVoltage2
            | Command::ReadVoltage3
            | Command::ReadVoltage4 => ResponseKind::Integer,
            Command::LedToggle => ResponseKind::Bool,
            Command::ReadFirmware => ResponseKind::Text,
            _ => ResponseKind::Ack,
        }
    }
}

impl ResponseKind {
    /// Decode `line` as this kind of answer
    pub fn decode(self, line: &[u8]) -> Result<Response, ProtocolError> {
        Ok(match self {
            ResponseKind::Ack => {
                decode_ack(line)?;
                Response::Ack
            }
            ResponseKind::Integer => Response::Integer(decode_int(line)?),
            ResponseKind::Bool => Response::Bool(decode_bool(line)?),
            ResponseKind::Text => Response::Text(decode_text(line)?),
        })
    }
}

/// Decoded answer of the box
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command acknowledged
    Ack,
    /// Voltage in mV, or raw ADC reading
    Integer(i32),
    /// LED state after a toggle
    Bool(bool),
    /// Firmware identifier
    Text(String),
}

/// Strip a trailing `\n` or `\r\n` from a response line
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Accept any non-empty line
pub fn decode_ack(line: &[u8]) -> Result<(), ProtocolError> {
    if trim_line(line).is_empty() {
        return Err(ProtocolError::EmptyResponse);
    }
    Ok(())
}

/// Decode an ASCII decimal integer
pub fn decode_int(line: &[u8]) -> Result<i32, ProtocolError> {
    let line = trim_line(line);
    if line.is_empty() {
        return Err(ProtocolError::EmptyResponse);
    }
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::InvalidResponse(format!("{:02x?}", line)))?;
    text.trim()
        .parse::<i32>()
        .map_err(|_| ProtocolError::InvalidResponse(text.to_string()))
}

/// Decode a one-byte boolean; the ASCII digits are accepted too
pub fn decode_bool(line: &[u8]) -> Result<bool, ProtocolError> {
    match trim_line(line).first() {
        None => Err(ProtocolError::EmptyResponse),
        Some(1) | Some(b'1') => Ok(true),
        Some(0) | Some(b'0') => Ok(false),
        Some(other) => Err(ProtocolError::InvalidResponse(format!("{:#04x}", other))),
    }
}

/// Decode a free-text line
pub fn decode_text(line: &[u8]) -> Result<String, ProtocolError> {
    let text = String::from_utf8_lossy(trim_line(line)).trim().to_string();
    if text.is_empty() {
        return Err(ProtocolError::EmptyResponse);
    }
    Ok(text)
}
