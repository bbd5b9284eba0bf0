//! Cycle Engine
//!
//! Runs unattended charge/discharge sessions on top of the driver. A session
//! is a worker task started by [`Driver::start`] and torn down by
//! [`Driver::stop`]; it streams snapshots and lifecycle events to the caller
//! and always ends with exactly one final event.

mod error;
mod message;
mod phase;

pub use error::CycleError;
pub use message::{format_duration, CycleKind, CycleMessage};

use std::sync::PoisonError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{BotMode, Config};
use crate::driver::{ChargeState, Driver, Snapshot};

/// Snapshots of a running session. Holds at most one value: a consumer that
/// stops draining it aborts the session.
pub type SnapshotStream = mpsc::Receiver<Snapshot>;

/// Lifecycle events of a running session
pub type EventStream = mpsc::Receiver<CycleMessage>;

/// Bookkeeping of the running session, owned by the driver
///
/// The handle stays in the driver until the worker has exited, including
/// while a `stop` is waiting for it. `done` is cancelled by the worker itself
/// when its future completes or is dropped.
pub(crate) struct SessionHandle {
    cancel: CancellationToken,
    done: CancellationToken,
    task: Option<JoinHandle<()>>,
    mode: BotMode,
    id: Uuid,
}

impl SessionHandle {
    fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }
}

fn running(session: &Option<SessionHandle>) -> bool {
    session.as_ref().is_some_and(SessionHandle::is_running)
}

/// Non-blocking event publisher. A consumer that lets its queue fill up is dropped.
struct EventSink {
    tx: Option<mpsc::Sender<CycleMessage>>,
}

impl EventSink {
    fn emit(&mut self, msg: CycleMessage) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(dropped = %msg, "event consumer is not keeping up, dropping it");
                self.tx = None;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tx = None;
            }
        }
    }
}

/// State of one session worker
pub(crate) struct Session {
    driver: Driver,
    config: Config,
    cancel: CancellationToken,
    snapshots: Option<mpsc::Sender<Snapshot>>,
    events: EventSink,
}

impl Session {
    async fn run(mut self) {
        info!(
            top = self.config.top_voltage,
            bottom = self.config.bottom_voltage,
            "session started"
        );
        let last = match self.config.mode {
            BotMode::Charger => self.charge().await,
            BotMode::Discharger => self.discharge().await,
            BotMode::Cycler => self.cycle().await,
            BotMode::ChargerX4 => self.charge_x4().await,
        };
        self.restore_idle().await;
        if last.erroneous {
            warn!(status = %last.status, "session failed");
        } else {
            info!(status = %last.status, "session ended");
        }
        self.events.emit(last);
    }

    async fn enter(&self, mode: ChargeState) {
        if let Err(e) = self.driver.set_charge_mode(mode).await {
            warn!(%mode, error = %e, "could not set charge mode, will retry on next tick");
        }
    }

    async fn charge(&mut self) -> CycleMessage {
        let kind = CycleKind::Charge;
        let target = self.config.top_voltage;
        self.events.emit(CycleMessage::started(kind, target));
        self.enter(ChargeState::Charging).await;

        let res = self
            .run_phase(self.config.up_duration, ChargeState::Charging, |s| {
                (s.voltage() >= target).then_some(())
            })
            .await;
        single_phase_outcome(kind, target, res.map(|_| CycleMessage::reached(kind, target)))
    }

    async fn discharge(&mut self) -> CycleMessage {
        let kind = CycleKind::Discharge;
        let target = self.config.bottom_voltage;
        self.events.emit(CycleMessage::started(kind, target));
        self.enter(ChargeState::Discharging).await;

        let res = self
            .run_phase(self.config.down_duration, ChargeState::Discharging, |s| {
                (s.voltage() <= target).then_some(())
            })
            .await;
        single_phase_outcome(kind, target, res.map(|_| CycleMessage::reached(kind, target)))
    }

    /// The first enabled slot to reach the top voltage ends the session
    async fn charge_x4(&mut self) -> CycleMessage {
        let kind = CycleKind::ChargeX4;
        let target = self.config.top_voltage;
        let slots = self.config.active_slots();
        self.events.emit(CycleMessage::started(kind, target));
        self.enter(ChargeState::ChargingX4).await;

        let res = self
            .run_phase(self.config.up_duration, ChargeState::ChargingX4, |s| {
                slots.iter().copied().find(|&i| s.voltages[i] >= target)
            })
            .await;
        single_phase_outcome(
            kind,
            target,
            res.map(|slot| {
                info!(battery = slot + 1, "battery reached target");
                CycleMessage::reached_slot(slot, target)
            }),
        )
    }

    async fn cycle(&mut self) -> CycleMessage {
        let total = self.config.nb_half_cycles;
        let mut charging = self.config.charge_first;
        let first_target = if charging {
            self.config.top_voltage
        } else {
            self.config.bottom_voltage
        };
        self.events
            .emit(CycleMessage::started(CycleKind::MultiCycle, first_target));

        let mut target = first_target;
        let mut n = 1;
        while total == 0 || n <= total {
            let (phase, mode, timeout) = if charging {
                ("Charge", ChargeState::Charging, self.config.up_duration)
            } else {
                ("Discharge", ChargeState::Discharging, self.config.down_duration)
            };
            target = if charging {
                self.config.top_voltage
            } else {
                self.config.bottom_voltage
            };
            info!(phase, n, total, "half-cycle started");
            self.events
                .emit(CycleMessage::half_cycle(target, phase, n, total));
            self.enter(mode).await;

            let reached = |s: &Snapshot| {
                let v = s.voltage();
                (if charging { v >= target } else { v <= target }).then_some(())
            };
            match self.run_phase(timeout, mode, reached).await {
                Ok(()) => {}
                Err(CycleError::Cancelled) => {
                    return CycleMessage::stopped(CycleKind::MultiCycle, target)
                }
                Err(CycleError::Timeout(after)) => {
                    return CycleMessage::half_cycle_timeout(target, phase, n, total, after)
                }
                Err(e) => return CycleMessage::half_cycle_failed(target, phase, n, total, e),
            }

            charging = !charging;
            n += 1;
        }
        CycleMessage::completed(target, total)
    }

    /// Best effort: the box is left in whatever mode it is in once the attempts run out
    async fn restore_idle(&self) {
        let options = self.driver.options();
        for attempt in 1..=options.idle_attempts {
            match self.driver.set_idle().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, error = %e, "failed to put the box back to idle");
                    if attempt < options.idle_attempts {
                        tokio::time::sleep(options.idle_backoff).await;
                    }
                }
            }
        }
        warn!(
            attempts = options.idle_attempts,
            "giving up on idle mode, box may still be active"
        );
    }
}

fn single_phase_outcome(
    kind: CycleKind,
    target: i32,
    res: Result<CycleMessage, CycleError>,
) -> CycleMessage {
    match res {
        Ok(msg) => msg,
        Err(CycleError::Cancelled) => CycleMessage::stopped(kind, target),
        Err(CycleError::Timeout(after)) => CycleMessage::timeout(kind, target, after),
        Err(e) => CycleMessage::failed(kind, target, e),
    }
}

impl Driver {
    /// Start a session with the current config
    ///
    /// Fails with [`CycleError::AlreadyRunning`] while a session runs; the
    /// running session is left untouched.
    pub fn start(&self) -> Result<(SnapshotStream, EventStream), CycleError> {
        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running(&session) {
            return Err(CycleError::AlreadyRunning);
        }
        let config = self.config();
        config.validate().map_err(CycleError::InvalidConfig)?;

        let (snap_tx, snap_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(self.options().event_depth.max(1));
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let id = Uuid::new_v4();
        let mode = config.mode;

        let worker = Session {
            driver: self.clone(),
            config,
            cancel: cancel.clone(),
            snapshots: Some(snap_tx),
            events: EventSink { tx: Some(event_tx) },
        };
        let span = info_span!("cycle", session = %id, mode = %mode);
        let exited = done.clone().drop_guard();
        let task = tokio::spawn(
            async move {
                let _exited = exited;
                worker.run().await
            }
            .instrument(span),
        );

        *session = Some(SessionHandle {
            cancel,
            done,
            task: Some(task),
            mode,
            id,
        });
        Ok((snap_rx, event_rx))
    }

    /// Cancel the running session and wait for its worker to exit.
    /// Returns right away when nothing runs.
    ///
    /// The session counts as running until the worker is gone, so `start`
    /// and `set_config` keep failing while the box is being put back to idle.
    pub async fn stop(&self) {
        let (id, done, task) = {
            let mut session = self
                .inner
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(handle) = session.as_mut() else {
                return;
            };
            handle.cancel.cancel();
            (handle.id, handle.done.clone(), handle.task.take())
        };

        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!(session = %id, error = %e, "session worker failed");
                }
            }
            // another stop owns the join
            None => done.cancelled().await,
        }

        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if session.as_ref().is_some_and(|h| h.id == id) {
            *session = None;
        }
    }

    /// Whether no session is running
    pub fn stopped(&self) -> bool {
        !running(
            &self
                .inner
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Mode of the running session, if any
    pub fn running_mode(&self) -> Option<BotMode> {
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        session
            .as_ref()
            .filter(|h| h.is_running())
            .map(|h| h.mode)
    }

    /// Replace the session configuration; refused while a session runs
    pub fn set_config(&self, config: Config) -> Result<(), CycleError> {
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running(&session) {
            return Err(CycleError::MustBeStopped);
        }
        config.validate().map_err(CycleError::InvalidConfig)?;
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}
