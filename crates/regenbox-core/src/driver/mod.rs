//! Device Driver
//!
//! Owns the transport and all device-side state. Every command exchange
//! (write one byte, read one line) runs under a single exclusive lock: the
//! box is half-duplex and only ever has one command outstanding. State
//! transitions happen only while that lock is held.

mod state;

pub use state::{ChargeState, ConnectionState, Snapshot};

use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cycle::SessionHandle;
use crate::protocol::{Command, ProtocolError, Response, Transport, SLOT_COUNT};

/// Driver and cycle engine tuning
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Pause before each command exchange
    pub command_spacing: Duration,
    /// Firmware lookups attempted before giving up
    pub firmware_attempts: u32,
    /// How long a snapshot may wait for its consumer before the session aborts
    pub publish_timeout: Duration,
    /// Depth of the cycle event queue
    pub event_depth: usize,
    /// Attempts at returning the box to idle when a session ends
    pub idle_attempts: u32,
    /// Pause between idle attempts
    pub idle_backoff: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            command_spacing: Duration::from_millis(50),
            firmware_attempts: 3,
            publish_timeout: Duration::from_secs(5),
            event_depth: 36,
            idle_attempts: 3,
            idle_backoff: Duration::from_millis(250),
        }
    }
}

/// Firmware identification state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firmware {
    /// Not retrieved yet
    Pending,
    /// Identifier reported by the box
    Known(String),
    /// The box never answered the lookup, likely an old firmware
    OutOfDate,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Firmware::Pending => f.write_str("unknown"),
            Firmware::Known(id) => f.write_str(id),
            Firmware::OutOfDate => f.write_str("unknown (firmware out of date)"),
        }
    }
}

/// The transport plus everything learned from the box through it
pub(crate) struct Link {
    transport: Option<Transport>,
    pinned_path: Option<String>,
    charge_state: ChargeState,
    state: ConnectionState,
    firmware: Firmware,
    firmware_attempts: u32,
    spacing: Duration,
    firmware_budget: u32,
}

impl Link {
    fn new(transport: Option<Transport>, options: &DriverOptions) -> Self {
        let state = if transport.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::NilBox
        };
        let pinned_path = transport
            .as_ref()
            .filter(|t| t.is_pinned())
            .and_then(|t| t.path().map(str::to_string));
        Self {
            transport,
            pinned_path,
            charge_state: ChargeState::Idle,
            state,
            firmware: Firmware::Pending,
            firmware_attempts: 0,
            spacing: options.command_spacing,
            firmware_budget: options.firmware_attempts,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn charge_state(&self) -> ChargeState {
        self.charge_state
    }

    pub(crate) fn pinned_path(&self) -> Option<&str> {
        self.pinned_path.as_deref()
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn transport_path(&self) -> Option<&str> {
        self.transport.as_ref().and_then(|t| t.path())
    }

    /// Write `cmd` and read its answer, classifying failures by the step that failed
    async fn transfer(&self, cmd: Command) -> Result<Vec<u8>, (ConnectionState, ProtocolError)> {
        let Some(transport) = self.transport.as_ref() else {
            let state = match self.state {
                ConnectionState::NilBox => ConnectionState::NilBox,
                _ => ConnectionState::Disconnected,
            };
            return Err((state, ProtocolError::NotConnected));
        };

        transport.discard_pending().await;
        if !self.spacing.is_zero() {
            tokio::time::sleep(self.spacing).await;
        }
        transport
            .write(&[cmd.byte()])
            .await
            .map_err(|e| (ConnectionState::WriteError, e))?;
        let line = transport
            .read()
            .await
            .map_err(|e| (ConnectionState::ReadError, e))?;
        if line.is_empty() {
            return Err((ConnectionState::UnexpectedError, ProtocolError::EmptyResponse));
        }
        Ok(line)
    }

    /// One exchange, recording its outcome on the connection state
    async fn talk(&mut self, cmd: Command) -> Result<Vec<u8>, ProtocolError> {
        match self.transfer(cmd).await {
            Ok(line) => {
                self.state = ConnectionState::Connected;
                Ok(line)
            }
            Err((state, err)) => {
                debug!(command = ?cmd, %state, error = %err, "exchange failed");
                self.state = state;
                Err(err)
            }
        }
    }

    /// One exchange, decoded according to the command's response kind
    async fn query(&mut self, cmd: Command) -> Result<Response, ProtocolError> {
        let line = self.talk(cmd).await?;
        cmd.response().decode(&line).inspect_err(|e| {
            if e.is_unexpected() {
                warn!(command = ?cmd, error = %e, "unexpected response");
                self.state = ConnectionState::UnexpectedError;
            }
        })
    }

    async fn query_int(&mut self, cmd: Command) -> Result<i32, ProtocolError> {
        match self.query(cmd).await? {
            Response::Integer(v) => Ok(v),
            other => Err(mismatch(cmd, other)),
        }
    }

    pub(crate) async fn ping(&mut self) -> Result<(), ProtocolError> {
        self.query(Command::Ping).await?;
        self.lookup_firmware().await;
        Ok(())
    }

    /// Bounded firmware retrieval; never touches the connection state
    async fn lookup_firmware(&mut self) {
        if self.firmware != Firmware::Pending {
            return;
        }
        self.firmware_attempts += 1;
        let cmd = Command::ReadFirmware;
        let res = match self.transfer(cmd).await {
            Ok(line) => match cmd.response().decode(&line) {
                Ok(Response::Text(id)) => Ok(id),
                Ok(other) => Err(mismatch(cmd, other)),
                Err(e) => Err(e),
            },
            Err((_, e)) => Err(e),
        };
        match res {
            Ok(id) => {
                info!(firmware = %id, "identified regenbox firmware");
                self.firmware = Firmware::Known(id);
            }
            Err(e) if self.firmware_attempts >= self.firmware_budget => {
                warn!(
                    attempts = self.firmware_attempts,
                    error = %e,
                    "no firmware identifier, box firmware is probably out of date"
                );
                self.firmware = Firmware::OutOfDate;
            }
            Err(e) => {
                debug!(attempt = self.firmware_attempts, error = %e, "firmware lookup failed");
            }
        }
    }

    pub(crate) async fn read_voltage(&mut self, slot: usize) -> Result<i32, ProtocolError> {
        let cmd = Command::read_voltage(slot).ok_or(ProtocolError::InvalidSlot(slot))?;
        self.query_int(cmd).await
    }

    pub(crate) async fn read_analog(&mut self) -> Result<i32, ProtocolError> {
        self.query_int(Command::ReadAnalog).await
    }

    pub(crate) async fn led_toggle(&mut self) -> Result<bool, ProtocolError> {
        match self.query(Command::LedToggle).await? {
            Response::Bool(on) => Ok(on),
            other => Err(mismatch(Command::LedToggle, other)),
        }
    }

    pub(crate) async fn command(&mut self, cmd: Command) -> Result<(), ProtocolError> {
        self.query(cmd).await.map(|_| ())
    }

    /// The cached charge state only changes once the box acknowledged the mode
    pub(crate) async fn set_charge_mode(&mut self, mode: ChargeState) -> Result<(), ProtocolError> {
        self.query(Command::for_charge_state(mode)).await?;
        if self.charge_state != mode {
            info!(from = %self.charge_state, to = %mode, "charge mode changed");
        }
        self.charge_state = mode;
        Ok(())
    }

    /// Read `slots` in order, stopping at the first failure
    pub(crate) async fn snapshot(&mut self, slots: &[usize]) -> Snapshot {
        let time = Utc::now();
        let mut voltages = [0; SLOT_COUNT];
        for &slot in slots {
            match self.read_voltage(slot).await {
                Ok(v) => voltages[slot] = v,
                Err(e) => {
                    debug!(slot, error = %e, "snapshot cut short");
                    break;
                }
            }
        }
        Snapshot {
            time,
            voltages,
            charge_state: self.charge_state,
            state: self.state,
            firmware: self.firmware.to_string(),
        }
    }

    /// Swap in a fresh transport; the old one, if any, is closed
    pub(crate) async fn install(&mut self, transport: Transport) {
        self.close_transport().await;
        if transport.is_pinned() {
            self.pinned_path = transport.path().map(str::to_string);
        }
        info!(path = ?transport.path(), "transport installed");
        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        self.firmware = Firmware::Pending;
        self.firmware_attempts = 0;
    }

    pub(crate) async fn close_transport(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if let Err(e) = transport.close().await {
            debug!(error = %e, "closing transport");
        }
        self.state = ConnectionState::Disconnected;
    }
}

fn mismatch(cmd: Command, got: Response) -> ProtocolError {
    ProtocolError::InvalidResponse(format!("{:?} answered {:?}", cmd, got))
}

pub(crate) struct Inner {
    pub(crate) link: tokio::sync::Mutex<Link>,
    pub(crate) config: RwLock<Config>,
    pub(crate) options: DriverOptions,
    pub(crate) session: Mutex<Option<SessionHandle>>,
}

/// Handle to a regenbox
///
/// Cheap to clone; all clones drive the same box.
#[derive(Clone)]
pub struct Driver {
    pub(crate) inner: Arc<Inner>,
}

impl Driver {
    /// Create a driver over `transport`, or over nothing until a watcher installs one
    pub fn new(transport: Option<Transport>, config: Config) -> Self {
        Self::with_options(transport, config, DriverOptions::default())
    }

    /// Create a driver with non-default tuning
    pub fn with_options(transport: Option<Transport>, config: Config, options: DriverOptions) -> Self {
        let link = Link::new(transport, &options);
        Self {
            inner: Arc::new(Inner {
                link: tokio::sync::Mutex::new(link),
                config: RwLock::new(config),
                options,
                session: Mutex::new(None),
            }),
        }
    }

    /// Tuning in effect
    pub fn options(&self) -> &DriverOptions {
        &self.inner.options
    }

    /// Current session configuration
    pub fn config(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) async fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.inner.link.lock().await
    }

    /// Liveness probe; also drives the bounded firmware lookup
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.lock_link().await.ping().await
    }

    /// Voltage in mV of a zero-based battery slot
    pub async fn read_voltage(&self, slot: usize) -> Result<i32, ProtocolError> {
        self.lock_link().await.read_voltage(slot).await
    }

    /// Raw A0 reading, without conversion. Prefer `read_voltage`.
    pub async fn read_analog(&self) -> Result<i32, ProtocolError> {
        self.lock_link().await.read_analog().await
    }

    /// Toggle the LED and return its new state
    pub async fn led_toggle(&self) -> Result<bool, ProtocolError> {
        self.lock_link().await.led_toggle().await
    }

    /// Switch the LED on or off
    pub async fn set_led(&self, on: bool) -> Result<(), ProtocolError> {
        let cmd = if on { Command::LedOn } else { Command::LedOff };
        self.lock_link().await.command(cmd).await
    }

    /// Drive the charge pin directly, bypassing the mode logic
    pub async fn set_charge_pin(&self, on: bool) -> Result<(), ProtocolError> {
        let cmd = if on { Command::ChargeOn } else { Command::ChargeOff };
        self.lock_link().await.command(cmd).await
    }

    /// Drive the discharge pin directly, bypassing the mode logic
    pub async fn set_discharge_pin(&self, on: bool) -> Result<(), ProtocolError> {
        let cmd = if on {
            Command::DischargeOn
        } else {
            Command::DischargeOff
        };
        self.lock_link().await.command(cmd).await
    }

    /// Put the box in `mode`. On failure the cached charge state is left untouched.
    pub async fn set_charge_mode(&self, mode: ChargeState) -> Result<(), ProtocolError> {
        self.lock_link().await.set_charge_mode(mode).await
    }

    /// Shorthand for `set_charge_mode(ChargeState::Charging)`
    pub async fn set_charge(&self) -> Result<(), ProtocolError> {
        self.set_charge_mode(ChargeState::Charging).await
    }

    /// Shorthand for `set_charge_mode(ChargeState::Discharging)`
    pub async fn set_discharge(&self) -> Result<(), ProtocolError> {
        self.set_charge_mode(ChargeState::Discharging).await
    }

    /// Shorthand for `set_charge_mode(ChargeState::Idle)`
    pub async fn set_idle(&self) -> Result<(), ProtocolError> {
        self.set_charge_mode(ChargeState::Idle).await
    }

    /// Read every configured slot in one locked sequence. Never fails: on an
    /// I/O error the snapshot carries the failure state and the voltages read so far.
    pub async fn snapshot(&self) -> Snapshot {
        let slots = self.config().active_slots();
        self.lock_link().await.snapshot(&slots).await
    }

    /// Last acknowledged charge mode
    pub async fn charge_state(&self) -> ChargeState {
        self.lock_link().await.charge_state
    }

    /// Outcome of the last exchange
    pub async fn connection_state(&self) -> ConnectionState {
        self.lock_link().await.state
    }

    /// Firmware lookup state
    pub async fn firmware(&self) -> Firmware {
        self.lock_link().await.firmware.clone()
    }

    /// Firmware identifier, or a placeholder while unknown
    pub async fn firmware_version(&self) -> String {
        self.firmware().await.to_string()
    }

    /// Install a new transport, closing the previous one
    pub async fn install_transport(&self, transport: Transport) {
        self.lock_link().await.install(transport).await;
    }

    /// Stop any running session and close the transport
    pub async fn close(&self) {
        self.stop().await;
        self.lock_link().await.close_transport().await;
        info!("driver closed");
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config())
            .field("stopped", &self.stopped())
            .finish()
    }
}

/// Send a `Ping` over `transport` and return the round-trip time
pub async fn test_connection(transport: &Transport) -> Result<Duration, ProtocolError> {
    let start = Instant::now();
    transport.discard_pending().await;
    transport.write(&[Command::Ping.byte()]).await?;
    let line = transport.read().await?;
    Command::Ping.response().decode(&line)?;
    Ok(start.elapsed())
}
