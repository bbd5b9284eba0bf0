//! Demo Mode - Simulated regenbox for testing
//!
//! `DemoBox` answers the firmware command set over blocking `Read`/`Write`
//! halves, so it plugs into a [`Transport`] exactly like a serial port.
//! Battery voltages drift up while charging and down while discharging.
//! Answers can be delayed, and faults such as an unplugged cable or failing
//! reads can be injected at any time.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::driver::ChargeState;
use crate::protocol::{Command, ProtocolError, Transport, TransportConfig, SLOT_COUNT};
use crate::watcher::Connector;

/// Firmware identifier reported by a fresh `DemoBox`
pub const DEMO_FIRMWARE: &str = "regenbox-demo v1.0";

/// 10-bit ADC over a 5 V reference
const ADC_MAX: i32 = 1023;
const ADC_REF_MV: i32 = 5000;

struct Noise {
    rng: StdRng,
    amplitude: i32,
}

struct BoxState {
    voltages: [i32; SLOT_COUNT],
    mode: ChargeState,
    led: bool,
    charge_pin: bool,
    discharge_pin: bool,
    firmware: Option<String>,
    /// mV added (charging) or removed (discharging) on every voltage read
    drift: i32,
    noise: Option<Noise>,
    plugged: bool,
    fail_writes: bool,
    fail_reads: bool,
    silent: bool,
    garbage: bool,
    /// Delay before an answer becomes readable
    latency: Duration,
    delayed: VecDeque<(Instant, Vec<u8>)>,
    outbound: VecDeque<u8>,
    received: Vec<Command>,
}

impl BoxState {
    fn answer(&mut self, cmd: Command) -> Option<Vec<u8>> {
        let ack = b"1".to_vec();
        let line = match cmd {
            Command::Ping => ack,
            Command::ReadAnalog => {
                let raw = self.voltages[0].clamp(0, ADC_REF_MV) * ADC_MAX / ADC_REF_MV;
                raw.to_string().into_bytes()
            }
            Command::ReadVoltage1
            | Command::ReadVoltage2
            | Command::ReadVoltage3
            | Command::ReadVoltage4 => {
                let slot = cmd.voltage_slot()?;
                self.read_voltage(slot).to_string().into_bytes()
            }
            Command::ReadFirmware => self.firmware.clone()?.into_bytes(),
            Command::LedOff => {
                self.led = false;
                ack
            }
            Command::LedOn => {
                self.led = true;
                ack
            }
            Command::LedToggle => {
                self.led = !self.led;
                vec![u8::from(self.led)]
            }
            Command::DischargeOff | Command::DischargeOn => {
                self.discharge_pin = cmd == Command::DischargeOn;
                ack
            }
            Command::ChargeOff | Command::ChargeOn => {
                self.charge_pin = cmd == Command::ChargeOn;
                ack
            }
            Command::ModeIdle
            | Command::ModeCharge
            | Command::ModeDischarge
            | Command::ModeChargeX4 => {
                let mode = cmd.charge_state()?;
                self.mode = mode;
                self.charge_pin = matches!(mode, ChargeState::Charging | ChargeState::ChargingX4);
                self.discharge_pin = mode == ChargeState::Discharging;
                ack
            }
        };
        Some(line)
    }

    fn read_voltage(&mut self, slot: usize) -> i32 {
        let step = match self.mode {
            ChargeState::Charging | ChargeState::ChargingX4 => self.drift,
            ChargeState::Discharging => -self.drift,
            ChargeState::Idle => 0,
        };
        self.voltages[slot] += step;
        let jitter = match self.noise.as_mut() {
            Some(n) if n.amplitude > 0 => n.rng.gen_range(-n.amplitude..=n.amplitude),
            _ => 0,
        };
        self.voltages[slot] + jitter
    }
}

/// In-process simulated regenbox. Clones share the same box.
#[derive(Clone)]
pub struct DemoBox {
    state: Arc<Mutex<BoxState>>,
}

impl Default for DemoBox {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoBox {
    /// A plugged, idle box with every battery at 1200 mV
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoxState {
                voltages: [1200; SLOT_COUNT],
                mode: ChargeState::Idle,
                led: false,
                charge_pin: false,
                discharge_pin: false,
                firmware: Some(DEMO_FIRMWARE.to_string()),
                drift: 0,
                noise: None,
                plugged: true,
                fail_writes: false,
                fail_reads: false,
                silent: false,
                garbage: false,
                latency: Duration::ZERO,
                delayed: VecDeque::new(),
                outbound: VecDeque::new(),
                received: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set every battery to `mv`
    pub fn with_voltage(self, mv: i32) -> Self {
        self.lock().voltages = [mv; SLOT_COUNT];
        self
    }

    /// Voltage change per read while charging or discharging
    pub fn with_drift(self, mv: i32) -> Self {
        self.lock().drift = mv;
        self
    }

    /// Add uniform noise of +/- `amplitude` mV to every voltage answer
    pub fn with_noise(self, amplitude: i32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.lock().noise = Some(Noise { rng, amplitude });
        self
    }

    /// Set the voltage of `slot` in mV; out-of-range slots are ignored
    pub fn set_voltage(&self, slot: usize, mv: i32) {
        if let Some(v) = self.lock().voltages.get_mut(slot) {
            *v = mv;
        }
    }

    /// Current slot voltages in mV
    pub fn voltages(&self) -> [i32; SLOT_COUNT] {
        self.lock().voltages
    }

    /// Voltage change applied on every read while charging or discharging
    pub fn set_drift(&self, mv: i32) {
        self.lock().drift = mv;
    }

    /// `None` emulates an old firmware that ignores `ReadFirmware`
    pub fn set_firmware(&self, firmware: Option<&str>) {
        self.lock().firmware = firmware.map(str::to_string);
    }

    /// Mode the box is in
    pub fn mode(&self) -> ChargeState {
        self.lock().mode
    }

    /// LED state
    pub fn led(&self) -> bool {
        self.lock().led
    }

    /// State of the (charge, discharge) pins
    pub fn pins(&self) -> (bool, bool) {
        let state = self.lock();
        (state.charge_pin, state.discharge_pin)
    }

    /// Commands received so far, in order
    pub fn received(&self) -> Vec<Command> {
        self.lock().received.clone()
    }

    /// Pull the cable: writes fail and nothing is read back
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.plugged = false;
        state.delayed.clear();
        state.outbound.clear();
    }

    /// Plug the cable back in; a real box resets, so the demo box goes idle
    pub fn replug(&self) {
        let mut state = self.lock();
        state.plugged = true;
        state.mode = ChargeState::Idle;
        state.charge_pin = false;
        state.discharge_pin = false;
    }

    /// Whether the cable is in
    pub fn is_plugged(&self) -> bool {
        self.lock().plugged
    }

    /// Make every write fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make every read fail with an I/O error
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Accept commands without ever answering
    pub fn silence(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Hold every answer back for `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Answer every command with a line that decodes to nothing
    pub fn garble(&self, garbage: bool) {
        self.lock().garbage = garbage;
    }

    /// Blocking device handle over this box
    pub fn port(&self) -> DemoPort {
        DemoPort {
            state: Arc::clone(&self.state),
        }
    }

    /// Transport over this box, with no device path
    pub fn transport(&self, config: TransportConfig) -> Transport {
        Transport::new(Box::new(self.port()), Box::new(self.port()), None, config)
    }

    /// Transport over this box, reporting `path` as its device path
    pub fn transport_at(&self, path: &str, config: TransportConfig) -> Transport {
        Transport::new(
            Box::new(self.port()),
            Box::new(self.port()),
            Some(path.to_string()),
            config,
        )
    }
}

/// Blocking read/write handle on a [`DemoBox`]
pub struct DemoPort {
    state: Arc<Mutex<BoxState>>,
}

impl Read for DemoPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_reads {
            state.delayed.clear();
            state.outbound.clear();
            return Err(io::Error::other("simulated read fault"));
        }
        let now = Instant::now();
        while state.delayed.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, line)) = state.delayed.pop_front() {
                state.outbound.extend(line);
            }
        }
        if state.outbound.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for DemoPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.plugged {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if state.fail_writes {
            return Err(io::Error::other("simulated write fault"));
        }
        for &byte in buf {
            let Some(cmd) = Command::from_byte(byte) else {
                continue;
            };
            state.received.push(cmd);
            let answer = state.answer(cmd);
            if state.silent {
                continue;
            }
            let line = if state.garbage {
                Some(b"?!".to_vec())
            } else {
                answer
            };
            if let Some(mut line) = line {
                line.extend_from_slice(b"\r\n");
                let ready_at = Instant::now() + state.latency;
                state.delayed.push_back((ready_at, line));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands out transports over a [`DemoBox`] while it is plugged
#[derive(Clone)]
pub struct DemoConnector {
    demo: DemoBox,
    config: TransportConfig,
    path: String,
}

impl DemoConnector {
    /// `path` is what a scan reports as the device path
    pub fn new(demo: DemoBox, path: &str, config: TransportConfig) -> Self {
        Self {
            demo,
            config,
            path: path.to_string(),
        }
    }
}

impl Connector for DemoConnector {
    async fn open(&self, path: &str) -> Result<Transport, ProtocolError> {
        if path != self.path || !self.demo.is_plugged() {
            return Err(ProtocolError::PortNotFound(path.to_string()));
        }
        Ok(self.demo.transport_at(path, self.config.clone()))
    }

    async fn scan(&self) -> Result<Transport, ProtocolError> {
        if !self.demo.is_plugged() {
            return Err(ProtocolError::NoPortFound);
        }
        Ok(self.demo.transport_at(&self.path, self.config.clone()))
    }
}
