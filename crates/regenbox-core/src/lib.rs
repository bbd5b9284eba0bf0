//! # Regenbox Core Library
//!
//! Driver and cycle engine for the RegenBox battery regenerator.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The regenbox serial byte protocol over a timeout-bounded transport
//! - A device driver serializing every command exchange
//! - Unattended charge, discharge, multi-cycle and 4-battery sessions
//! - A connection watcher recovering from USB/serial loss
//! - A simulated box for tests and demos
//!
//! ## Example
//!
//! ```rust,ignore
//! use regenbox_core::prelude::*;
//!
//! let transport = Transport::open("/dev/ttyUSB0", TransportConfig::default())?.pinned();
//! let driver = Driver::new(Some(transport), Config::default());
//! let watcher = Watcher::spawn(driver.clone(), SerialConnector::default(), WatcherConfig::default());
//!
//! let (mut snapshots, mut events) = driver.start()?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event);
//!     if event.is_final {
//!         break;
//!     }
//! }
//! watcher.stop().await;
//! driver.close().await;
//! ```

pub mod config;
pub mod cycle;
pub mod demo;
pub mod driver;
pub mod hub;
pub mod protocol;
pub mod watcher;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BotMode, Config};
    pub use crate::cycle::{CycleError, CycleKind, CycleMessage, EventStream, SnapshotStream};
    pub use crate::demo::{DemoBox, DemoConnector};
    pub use crate::driver::{ChargeState, ConnectionState, Driver, DriverOptions, Firmware, Snapshot};
    pub use crate::hub::EventHub;
    pub use crate::protocol::{Command, ProtocolError, Transport, TransportConfig};
    pub use crate::watcher::{Connector, SerialConnector, Watcher, WatcherConfig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
