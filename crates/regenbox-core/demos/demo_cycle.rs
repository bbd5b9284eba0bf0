//! RegenBox demo session
//!
//! Runs a short multi-cycle session against the simulated box, with the
//! connection watcher attached and the cable pulled halfway through.
//!
//! Usage:
//!   cargo run --example demo_cycle
//!   RUST_LOG=regenbox_core=debug cargo run --example demo_cycle

use std::time::Duration;

use anyhow::Context;
use regenbox_core::prelude::*;
use tracing_subscriber::EnvFilter;

const DEMO_PATH: &str = "/dev/ttyDEMO0";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("regenbox-core {}", regenbox_core::VERSION);

    let demo = DemoBox::new()
        .with_voltage(1150)
        .with_drift(15)
        .with_noise(3, None);
    let config = Config {
        mode: BotMode::Cycler,
        nb_half_cycles: 4,
        top_voltage: 1400,
        bottom_voltage: 1100,
        ticker: Duration::from_millis(100),
        up_duration: Duration::from_secs(30),
        down_duration: Duration::from_secs(30),
        ..Config::default()
    };
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("demo config")?;

    let transport = demo
        .transport_at(DEMO_PATH, TransportConfig::default())
        .pinned();
    let driver = Driver::new(Some(transport), config);
    let watcher = Watcher::spawn(
        driver.clone(),
        DemoConnector::new(demo.clone(), DEMO_PATH, TransportConfig::default()),
        WatcherConfig::default(),
    );

    let (mut snapshots, events) = driver.start().context("starting session")?;
    let hub = EventHub::default();
    let (_, mut feed) = hub.subscribe();
    let pump = hub.pump(events);

    tokio::spawn(async move {
        while let Some(snapshot) = snapshots.recv().await {
            println!("  {}", snapshot);
        }
    });

    let cable = demo.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        println!("-- cable pulled --");
        cable.unplug();
        tokio::time::sleep(Duration::from_secs(2)).await;
        println!("-- cable plugged back --");
        cable.replug();
    });

    while let Some(event) = feed.recv().await {
        println!("{}", event);
        if event.is_final {
            break;
        }
    }

    pump.await.context("event pump")?;
    watcher.stop().await;
    println!("firmware: {}", driver.firmware_version().await);
    driver.close().await;
    Ok(())
}
