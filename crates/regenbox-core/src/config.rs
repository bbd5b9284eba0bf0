//! Session configuration
//!
//! Operating parameters of a charge/discharge session. A `Config` is handed
//! to the driver at construction and may only be replaced while no session
//! is running.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::SLOT_COUNT;

/// Kind of session the cycle engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BotMode {
    /// Charge until the top voltage is reached
    Charger,
    /// Discharge until the bottom voltage is reached
    Discharger,
    /// Alternate charge and discharge half-cycles
    Cycler,
    /// Charge up to four batteries at once
    ChargerX4,
}

const BOT_MODES: [BotMode; 4] = [
    BotMode::Charger,
    BotMode::Discharger,
    BotMode::Cycler,
    BotMode::ChargerX4,
];

impl fmt::Display for BotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotMode::Charger => "Charger",
            BotMode::Discharger => "Discharger",
            BotMode::Cycler => "Cycler",
            BotMode::ChargerX4 => "ChargerX4",
        };
        f.write_str(name)
    }
}

impl FromStr for BotMode {
    type Err = String;

    /// Accepts the mode name or its ordinal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(mode) = BOT_MODES.iter().find(|m| m.to_string() == s) {
            return Ok(*mode);
        }
        s.parse::<usize>()
            .ok()
            .and_then(|i| BOT_MODES.get(i).copied())
            .ok_or_else(|| format!("cannot parse \"{}\" as a mode, is it misspelled?", s))
    }
}

/// Parameters of a charge/discharge session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Session kind
    pub mode: BotMode,
    /// Number of half-cycles in `Cycler` mode, 0 for unlimited
    pub nb_half_cycles: u32,
    /// Timeout of a charge phase
    #[serde(with = "duration_ms")]
    pub up_duration: Duration,
    /// Timeout of a discharge phase
    #[serde(with = "duration_ms")]
    pub down_duration: Duration,
    /// Charge target in mV
    pub top_voltage: i32,
    /// Discharge target in mV
    pub bottom_voltage: i32,
    /// Polling interval of a running phase
    #[serde(with = "duration_ms")]
    pub ticker: Duration,
    /// Start `Cycler` sessions with a charge
    pub charge_first: bool,
    /// Enabled battery slots in `ChargerX4` mode
    pub batteries: [bool; SLOT_COUNT],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: BotMode::Charger,
            nb_half_cycles: 10,
            up_duration: Duration::from_secs(2 * 3600),
            down_duration: Duration::from_secs(2 * 3600),
            top_voltage: 1410,
            bottom_voltage: 850,
            ticker: Duration::from_secs(1),
            charge_first: true,
            batteries: [true; SLOT_COUNT],
        }
    }
}

impl Config {
    /// Check the invariants a session relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.top_voltage <= self.bottom_voltage {
            return Err(format!(
                "top voltage ({} mV) must be above bottom voltage ({} mV)",
                self.top_voltage, self.bottom_voltage
            ));
        }
        if self.ticker.is_zero() {
            return Err("poll interval must be greater than zero".to_string());
        }
        if self.mode == BotMode::ChargerX4 && !self.batteries.iter().any(|b| *b) {
            return Err("ChargerX4 mode needs at least one enabled battery slot".to_string());
        }
        Ok(())
    }

    /// Zero-based slots a snapshot reads for this config
    pub fn active_slots(&self) -> Vec<usize> {
        match self.mode {
            BotMode::ChargerX4 => (0..SLOT_COUNT).filter(|i| self.batteries[*i]).collect(),
            _ => vec![0],
        }
    }
}

/// (De)serialize a `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_voltages() {
        let cfg = Config {
            top_voltage: 900,
            bottom_voltage: 900,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ticker() {
        let cfg = Config {
            ticker: Duration::ZERO,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_x4_needs_a_slot() {
        let cfg = Config {
            mode: BotMode::ChargerX4,
            batteries: [false; SLOT_COUNT],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_active_slots() {
        let mut cfg = Config::default();
        assert_eq!(cfg.active_slots(), vec![0]);
        cfg.mode = BotMode::ChargerX4;
        cfg.batteries = [false, true, false, true];
        assert_eq!(cfg.active_slots(), vec![1, 3]);
    }

    #[test]
    fn test_bot_mode_from_str() {
        assert_eq!("Cycler".parse::<BotMode>().unwrap(), BotMode::Cycler);
        assert_eq!("3".parse::<BotMode>().unwrap(), BotMode::ChargerX4);
        assert!("Charjer".parse::<BotMode>().is_err());
    }
}
