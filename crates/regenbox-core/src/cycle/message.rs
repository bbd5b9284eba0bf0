//! Session lifecycle events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Session family a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleKind {
    /// Single charge to the top voltage
    Charge,
    /// Charge of up to four batteries at once
    ChargeX4,
    /// Single discharge to the bottom voltage
    Discharge,
    /// Alternating charges and discharges
    #[serde(rename = "Multi-cycle")]
    MultiCycle,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleKind::Charge => "Charge",
            CycleKind::ChargeX4 => "ChargeX4",
            CycleKind::Discharge => "Discharge",
            CycleKind::MultiCycle => "Multi-cycle",
        })
    }
}

/// One lifecycle notification of a running session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CycleMessage {
    /// Session family
    #[serde(rename = "Type")]
    pub kind: CycleKind,
    /// Target voltage of the running phase, in mV
    pub target: i32,
    /// Human readable progress
    pub status: String,
    /// Underlying error text, when the message reports a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set for timeouts and failures
    pub erroneous: bool,
    /// Set on the last message of a session
    #[serde(rename = "Final")]
    pub is_final: bool,
}

impl CycleMessage {
    fn new(kind: CycleKind, target: i32, status: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            status: status.into(),
            error: None,
            erroneous: false,
            is_final: false,
        }
    }

    fn terminal(mut self, erroneous: bool) -> Self {
        self.erroneous = erroneous;
        self.is_final = true;
        self
    }

    /// First message of every session
    pub fn started(kind: CycleKind, target: i32) -> Self {
        Self::new(kind, target, "Started...")
    }

    /// Stop condition met
    pub fn reached(kind: CycleKind, target: i32) -> Self {
        Self::new(kind, target, "Target voltage reached").terminal(false)
    }

    /// `slot` is zero-based; batteries are numbered from 1 for display
    pub fn reached_slot(slot: usize, target: i32) -> Self {
        Self::new(
            CycleKind::ChargeX4,
            target,
            format!("Target voltage reached for battery #{}...", slot + 1),
        )
        .terminal(false)
    }

    /// Phase ran out of time
    pub fn timeout(kind: CycleKind, target: i32, after: Duration) -> Self {
        let status = format!("Didn't reach target after {}", format_duration(after));
        let mut msg = Self::new(kind, target, status).terminal(true);
        msg.error = Some(msg.status.clone());
        msg
    }

    /// Session cancelled through `Driver::stop`
    pub fn stopped(kind: CycleKind, target: i32) -> Self {
        Self::new(kind, target, "Stopped by user").terminal(false)
    }

    /// Session aborted by `error`
    pub fn failed(kind: CycleKind, target: i32, error: impl fmt::Display) -> Self {
        let text = error.to_string();
        let mut msg = Self::new(kind, target, text.clone()).terminal(true);
        msg.error = Some(text);
        msg
    }

    /// Start of half-cycle `n` out of `of`; `of == 0` means unlimited
    pub fn half_cycle(target: i32, phase: &str, n: u32, of: u32) -> Self {
        Self::new(
            CycleKind::MultiCycle,
            target,
            format!("{} {}/{}...", phase, n, half_cycle_total(of)),
        )
    }

    /// Half-cycle `n` ran out of time
    pub fn half_cycle_timeout(target: i32, phase: &str, n: u32, of: u32, after: Duration) -> Self {
        Self::failed(
            CycleKind::MultiCycle,
            target,
            format!(
                "{} {}/{} didn't reach target after {}",
                phase,
                n,
                half_cycle_total(of),
                format_duration(after)
            ),
        )
    }

    /// Half-cycle `n` aborted by `error`
    pub fn half_cycle_failed(target: i32, phase: &str, n: u32, of: u32, error: impl fmt::Display) -> Self {
        Self::failed(
            CycleKind::MultiCycle,
            target,
            format!("{} {}/{}: {}", phase, n, half_cycle_total(of), error),
        )
    }

    /// Every half-cycle reached its target
    pub fn completed(target: i32, n: u32) -> Self {
        Self::new(
            CycleKind::MultiCycle,
            target,
            format!("Completed {} half-cycles", n),
        )
        .terminal(false)
    }
}

impl fmt::Display for CycleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({} mV)", self.kind, self.status, self.target)?;
        if self.is_final {
            f.write_str(" [final]")?;
        }
        Ok(())
    }
}

fn half_cycle_total(of: u32) -> String {
    if of == 0 {
        "∞".to_string()
    } else {
        of.to_string()
    }
}

/// Render a duration the way the front-end has always shown them: `2h0m0s`, `1m30s`, `50ms`
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let nanos = d.subsec_nanos();
    let secs = d.as_secs();
    if secs == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}µs", nanos / 1_000)
        } else {
            format!("{}ns", nanos)
        };
    }

    let mut out = String::new();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    out.push_str(&s.to_string());
    if nanos > 0 {
        let frac = format!("{:09}", nanos);
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
    out.push('s');
    out
}
