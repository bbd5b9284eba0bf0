//! Device-side state reported by the driver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::{Command, SLOT_COUNT};

/// Health of the link to the box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// A transport was closed and not replaced yet
    Disconnected,
    /// Last exchange succeeded
    Connected,
    /// Last command could not be written
    WriteError,
    /// Last response could not be read
    ReadError,
    /// Last response was empty or malformed
    UnexpectedError,
    /// No transport was ever installed
    NilBox,
}

const CONNECTION_STATES: [ConnectionState; 6] = [
    ConnectionState::Disconnected,
    ConnectionState::Connected,
    ConnectionState::WriteError,
    ConnectionState::ReadError,
    ConnectionState::UnexpectedError,
    ConnectionState::NilBox,
];

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    /// Accepts the state name or its ordinal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(state) = CONNECTION_STATES.iter().find(|c| c.to_string() == s) {
            return Ok(*state);
        }
        s.parse::<usize>()
            .ok()
            .and_then(|i| CONNECTION_STATES.get(i).copied())
            .ok_or_else(|| format!("cannot parse \"{}\" as a connection state", s))
    }
}

/// Charge mode the box was last told to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChargeState {
    /// Neither charging nor discharging
    #[default]
    Idle,
    /// Charging slot 1
    Charging,
    /// Discharging slot 1
    Discharging,
    /// Charging all four slots
    ChargingX4,
}

const CHARGE_STATES: [ChargeState; 4] = [
    ChargeState::Idle,
    ChargeState::Charging,
    ChargeState::Discharging,
    ChargeState::ChargingX4,
];

impl ChargeState {
    /// Wire byte of the mode command for this state
    pub fn mode_byte(&self) -> u8 {
        Command::for_charge_state(*self).byte()
    }

    /// State selected by a mode command byte
    pub fn from_mode_byte(byte: u8) -> Option<ChargeState> {
        Command::from_byte(byte).and_then(|c| c.charge_state())
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for ChargeState {
    type Err = String;

    /// Accepts the state name or its mode byte in decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(state) = CHARGE_STATES.iter().find(|c| c.to_string() == s) {
            return Ok(*state);
        }
        s.parse::<u8>()
            .ok()
            .and_then(ChargeState::from_mode_byte)
            .ok_or_else(|| format!("cannot parse \"{}\" as a charge state", s))
    }
}

/// Point-in-time reading of the box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    /// When the read sequence started
    pub time: DateTime<Utc>,
    /// Slot voltages in mV, 0 where not read
    pub voltages: [i32; SLOT_COUNT],
    /// Charge mode at read time
    pub charge_state: ChargeState,
    /// Link health after the read sequence
    pub state: ConnectionState,
    /// Firmware identifier or placeholder
    pub firmware: String,
}

impl Snapshot {
    /// Voltage of the first slot
    pub fn voltage(&self) -> i32 {
        self.voltages[0]
    }

    /// Whether the read sequence completed over a healthy link
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} mV {} {}",
            self.time.format("%H:%M:%S"),
            self.voltages,
            self.charge_state,
            self.state
        )
    }
}
