//! Byte transport
//!
//! The serial handle only offers blocking reads and writes, so each
//! `Transport` runs two blocking workers: one drains outbound write requests,
//! the other polls the device and splits the inbound bytes into lines.
//! Callers get async `read`/`write` bounded by per-call timeouts.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serialport::SerialPort;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::trim_line;
use super::serial::open_port;
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, MAX_LINE_LEN};

/// Blocking inbound half of a device handle
pub type DeviceReader = Box<dyn Read + Send>;

/// Blocking outbound half of a device handle
pub type DeviceWriter = Box<dyn Write + Send>;

type Line = io::Result<Vec<u8>>;

/// Lines the read worker may queue ahead of the caller
const READ_QUEUE_DEPTH: usize = 4;

/// How long `close` waits for each worker to exit
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport timing configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum wait for a response line
    pub read_timeout: Duration,
    /// Maximum wait for the write worker to accept and complete a write
    pub write_timeout: Duration,
    /// Pause between device reads that returned nothing
    pub poll_interval: Duration,
    /// Serial baud rate, used when opening a port
    pub baud_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(10),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl TransportConfig {
    /// Shorter timeouts used while probing candidate ports
    pub fn probing() -> Self {
        Self {
            read_timeout: Duration::from_millis(250),
            write_timeout: Duration::from_millis(250),
            ..Self::default()
        }
    }
}

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<io::Result<()>>,
}

/// Line-oriented link to the box
///
/// Must be created from within a tokio runtime. Once closed a transport is
/// never reopened; build a new one instead.
pub struct Transport {
    path: Option<String>,
    pinned: bool,
    config: TransportConfig,
    write_tx: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    read_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Line>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Start the read and write workers over a pair of blocking handles
    pub fn new(
        reader: DeviceReader,
        writer: DeviceWriter,
        path: Option<String>,
        config: TransportConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (write_tx, write_rx) = mpsc::channel(1);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);

        let poll = config.poll_interval;
        let read_cancel = cancel.clone();
        let reader_task =
            tokio::task::spawn_blocking(move || read_loop(reader, read_tx, read_cancel, poll));
        let write_cancel = cancel.clone();
        let writer_task =
            tokio::task::spawn_blocking(move || write_loop(writer, write_rx, write_cancel));

        Self {
            path,
            pinned: false,
            config,
            write_tx: Mutex::new(Some(write_tx)),
            read_rx: tokio::sync::Mutex::new(Some(read_rx)),
            cancel,
            closed: AtomicBool::new(false),
            workers: Mutex::new(vec![reader_task, writer_task]),
        }
    }

    /// Wrap an already opened serial port
    pub fn from_port(
        port: Box<dyn SerialPort>,
        path: &str,
        config: TransportConfig,
    ) -> Result<Self, ProtocolError> {
        let reader = port
            .try_clone()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(Self::new(
            Box::new(reader),
            Box::new(port),
            Some(path.to_string()),
            config,
        ))
    }

    /// Open the serial port at `path`. Blocks while the port opens.
    pub fn open(path: &str, config: TransportConfig) -> Result<Self, ProtocolError> {
        let port = open_port(path, Some(config.baud_rate))?;
        info!(path, baud = config.baud_rate, "opened serial port");
        Self::from_port(port, path, config)
    }

    /// Mark the path as explicitly chosen, so reconnects reopen it instead of scanning
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Switch to the read and write timeouts of `config`, keeping the open port
    pub fn with_timeouts(mut self, config: &TransportConfig) -> Self {
        self.config.read_timeout = config.read_timeout;
        self.config.write_timeout = config.write_timeout;
        self
    }

    /// Device path, if the transport was opened from one
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether reconnects should reuse this exact path
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Timing configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand `bytes` to the write worker and wait for the device write to finish
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let timeout = self.config.write_timeout;
        let tx = self
            .write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProtocolError::Closed)?;

        let (done_tx, done_rx) = oneshot::channel();
        let request = WriteRequest {
            bytes: bytes.to_vec(),
            done: done_tx,
        };
        match tokio::time::timeout(timeout, tx.send(request)).await {
            Err(_) => {
                return Err(ProtocolError::Timeout {
                    operation: "write",
                    after: timeout,
                })
            }
            Ok(Err(_)) => return Err(ProtocolError::Closed),
            Ok(Ok(())) => {}
        }
        drop(tx);

        match tokio::time::timeout(timeout, done_rx).await {
            Err(_) => Err(ProtocolError::Timeout {
                operation: "write",
                after: timeout,
            }),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Ok(Ok(Err(e))) => Err(ProtocolError::IoError(e)),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    /// Wait for the next response line, without its terminator
    pub async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let timeout = self.config.read_timeout;
        let mut guard = self.read_rx.lock().await;
        let rx = guard.as_mut().ok_or(ProtocolError::Closed)?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Closed),
            res = tokio::time::timeout(timeout, rx.recv()) => match res {
                Err(_) => Err(ProtocolError::Timeout { operation: "read", after: timeout }),
                Ok(None) => Err(ProtocolError::Closed),
                Ok(Some(Err(e))) => Err(ProtocolError::IoError(e)),
                Ok(Some(Ok(line))) => Ok(line),
            },
        }
    }

    /// Drop lines queued by earlier exchanges; returns how many were dropped
    pub async fn discard_pending(&self) -> usize {
        let mut guard = self.read_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded stale response lines");
        }
        dropped
    }

    /// Stop both workers, wait for them (bounded) and release the handle
    pub async fn close(&self) -> Result<(), ProtocolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyClosed);
        }
        self.cancel.cancel();
        self.write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.read_rx.lock().await.take();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if tokio::time::timeout(CLOSE_JOIN_TIMEOUT, worker).await.is_err() {
                warn!(path = ?self.path, "transport worker did not exit in time");
            }
        }
        debug!(path = ?self.path, "transport closed");
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("path", &self.path)
            .field("pinned", &self.pinned)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn read_loop(
    mut reader: DeviceReader,
    lines: mpsc::Sender<Line>,
    cancel: CancellationToken,
    poll: Duration,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];

    while !cancel.is_cancelled() {
        match reader.read(&mut buf) {
            Ok(0) => std::thread::sleep(poll),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    if lines.blocking_send(Ok(trim_line(&line).to_vec())).is_err() {
                        return;
                    }
                }
                if pending.len() > MAX_LINE_LEN {
                    pending.clear();
                    let err = io::Error::new(io::ErrorKind::InvalidData, "response line too long");
                    if lines.blocking_send(Err(err)).is_err() {
                        return;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                std::thread::sleep(poll)
            }
            Err(e) => {
                debug!(error = %e, "device read failed");
                // one queued error is enough to fail the next read
                if let Err(mpsc::error::TrySendError::Closed(_)) = lines.try_send(Err(e)) {
                    return;
                }
                std::thread::sleep(poll);
            }
        }
    }
}

fn write_loop(
    mut writer: DeviceWriter,
    mut requests: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    while let Some(request) = requests.blocking_recv() {
        if cancel.is_cancelled() {
            break;
        }
        let res = writer
            .write_all(&request.bytes)
            .and_then(|_| writer.flush());
        let _ = request.done.send(res);
    }
}
