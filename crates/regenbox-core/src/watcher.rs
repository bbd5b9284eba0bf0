//! Connection Watcher
//!
//! Background task keeping the driver connected. It pings the box on a fixed
//! interval; when the link fails it drops the stale transport, acquires a new
//! one (the pinned path if there is one, a port scan otherwise), installs it
//! and replays the last known charge mode.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{test_connection, ConnectionState, Driver};
use crate::protocol::{list_ports, open_port, ProtocolError, Transport, TransportConfig};

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between liveness checks
    pub poll_rate: Duration,
    /// Explicit device path; when set the watcher never scans
    pub device: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_rate: Duration::from_secs(1),
            device: None,
        }
    }
}

/// Source of fresh transports
pub trait Connector: Send + Sync + 'static {
    /// Open the device at `path`
    fn open(&self, path: &str) -> impl Future<Output = Result<Transport, ProtocolError>> + Send;

    /// Find a box among the available devices
    fn scan(&self) -> impl Future<Output = Result<Transport, ProtocolError>> + Send;
}

/// Opens serial ports; scanning probes every port with a ping
#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    /// Timeouts of the transports handed out
    pub config: TransportConfig,
}

impl SerialConnector {
    /// Connector opening ports with `config`
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn open_with(path: &str, config: TransportConfig) -> Result<Transport, ProtocolError> {
        let owned = path.to_string();
        let baud = config.baud_rate;
        let port = tokio::task::spawn_blocking(move || open_port(&owned, Some(baud)))
            .await
            .map_err(|e| ProtocolError::SerialError(e.to_string()))??;
        Transport::from_port(port, path, config)
    }

    /// Open `path` with probing timeouts and keep the transport if a box answers
    async fn probe(&self, path: &str) -> Option<Transport> {
        let probing = TransportConfig {
            poll_interval: self.config.poll_interval,
            baud_rate: self.config.baud_rate,
            ..TransportConfig::probing()
        };
        match Self::open_with(path, probing).await {
            Ok(t) => keep_if_answering(t).await,
            Err(e) => {
                debug!(path, error = %e, "cannot open candidate port");
                None
            }
        }
    }
}

/// Ping `transport`; close it unless a box answered
///
/// The answering transport is handed back still open, since reopening a port
/// resets Arduino-class boards.
async fn keep_if_answering(transport: Transport) -> Option<Transport> {
    let path = transport.path().unwrap_or("<unnamed>").to_string();
    match test_connection(&transport).await {
        Ok(rtt) => {
            debug!(%path, ?rtt, "regenbox answered");
            Some(transport)
        }
        Err(e) => {
            debug!(%path, error = %e, "no regenbox on port");
            let _ = transport.close().await;
            None
        }
    }
}

impl Connector for SerialConnector {
    async fn open(&self, path: &str) -> Result<Transport, ProtocolError> {
        Self::open_with(path, self.config.clone()).await
    }

    async fn scan(&self) -> Result<Transport, ProtocolError> {
        let ports = tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        for port in ports {
            if let Some(transport) = self.probe(&port.name).await {
                info!(path = %port.name, "found regenbox");
                return Ok(transport.with_timeouts(&self.config));
            }
        }
        Err(ProtocolError::NoPortFound)
    }
}

/// Handle to the running watcher task
pub struct Watcher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Start watching `driver`. Must be called from within a tokio runtime.
    pub fn spawn<C: Connector>(driver: Driver, connector: C, config: WatcherConfig) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_rate);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(poll_rate = ?config.poll_rate, device = ?config.device, "watcher started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                check(&driver, &connector, &config).await;
            }
            debug!("watcher stopped");
        });
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Signal the task and wait for it to exit. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task failed");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One watcher round: check the link, recover it if needed
async fn check<C: Connector>(driver: &Driver, connector: &C, config: &WatcherConfig) {
    let path = {
        let mut link = driver.lock_link().await;
        if link.has_transport() {
            let was_connected = link.state() == ConnectionState::Connected;
            match link.ping().await {
                Ok(()) => return,
                Err(e) if was_connected => {
                    warn!(error = %e, path = ?link.transport_path(), "lost connection to regenbox");
                }
                Err(e) => debug!(error = %e, "regenbox still unreachable"),
            }
            link.close_transport().await;
        }
        config
            .device
            .clone()
            .or_else(|| link.pinned_path().map(str::to_string))
    };

    // the lock is not held while ports are opened or scanned
    let res = match &path {
        Some(path) => connector.open(path).await.map(Transport::pinned),
        None => connector.scan().await,
    };
    let transport = match res {
        Ok(t) => t,
        Err(e) => {
            debug!(path = ?path, error = %e, "reconnect attempt failed");
            return;
        }
    };

    let mut link = driver.lock_link().await;
    link.install(transport).await;
    let mode = link.charge_state();
    info!(path = ?link.transport_path(), %mode, "reconnected to regenbox");
    if let Err(e) = link.set_charge_mode(mode).await {
        warn!(%mode, error = %e, "could not restore charge mode after reconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoBox;
    use crate::protocol::Command;

    #[test]
    fn test_default_config() {
        let cfg = WatcherConfig::default();
        assert_eq!(cfg.poll_rate, Duration::from_secs(1));
        assert!(cfg.device.is_none());
    }

    fn quick() -> TransportConfig {
        TransportConfig {
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            ..TransportConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_answering_port_is_kept_open() {
        let demo = DemoBox::new();
        let transport = demo.transport_at("/dev/ttyUSB0", quick());
        let kept = keep_if_answering(transport).await.unwrap();
        assert!(!kept.is_closed());
        assert_eq!(kept.path(), Some("/dev/ttyUSB0"));
        assert_eq!(demo.received(), vec![Command::Ping]);

        // still the same link: no second open needed to talk to the box
        kept.write(&[Command::Ping.byte()]).await.unwrap();
        assert!(!kept.read().await.unwrap().is_empty());
        kept.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_port_is_closed() {
        let demo = DemoBox::new();
        demo.silence(true);
        let transport = demo.transport_at("/dev/ttyACM0", quick());
        assert!(keep_if_answering(transport).await.is_none());
    }
}
