//! Connection recovery against the simulated box

use regenbox_core::config::{BotMode, Config};
use regenbox_core::demo::{DemoBox, DemoConnector, DEMO_FIRMWARE};
use regenbox_core::driver::{ChargeState, ConnectionState, Driver, DriverOptions, Firmware};
use regenbox_core::protocol::TransportConfig;
use regenbox_core::watcher::{Watcher, WatcherConfig};
use std::time::{Duration, Instant};

const DEMO_PATH: &str = "/dev/ttyDEMO0";

fn fast_transport() -> TransportConfig {
    TransportConfig {
        read_timeout: Duration::from_millis(100),
        write_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        ..TransportConfig::default()
    }
}

fn fast_options() -> DriverOptions {
    DriverOptions {
        command_spacing: Duration::ZERO,
        idle_backoff: Duration::from_millis(10),
        ..DriverOptions::default()
    }
}

fn watcher_config(device: Option<&str>) -> WatcherConfig {
    WatcherConfig {
        poll_rate: Duration::from_millis(20),
        device: device.map(str::to_string),
    }
}

async fn wait_for_state(driver: &Driver, want: ConnectionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = driver.connection_state().await;
        if state == want {
            return;
        }
        assert!(Instant::now() < deadline, "still {} instead of {}", state, want);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnects_pinned_path_and_restores_mode() {
    let demo = DemoBox::new();
    let transport = demo.transport_at(DEMO_PATH, fast_transport()).pinned();
    let driver = Driver::with_options(Some(transport), Config::default(), fast_options());
    let connector = DemoConnector::new(demo.clone(), DEMO_PATH, fast_transport());
    let watcher = Watcher::spawn(driver.clone(), connector, watcher_config(None));

    driver.set_charge().await.unwrap();
    demo.unplug();
    wait_for_state(&driver, ConnectionState::Disconnected).await;

    // the box resets to idle when plugged back in
    demo.replug();
    assert_eq!(demo.mode(), ChargeState::Idle);
    wait_for_state(&driver, ConnectionState::Connected).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while demo.mode() != ChargeState::Charging {
        assert!(Instant::now() < deadline, "charge mode was not restored");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(driver.charge_state().await, ChargeState::Charging);

    watcher.stop().await;
    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scans_when_no_box_was_ever_connected() {
    let demo = DemoBox::new();
    let driver = Driver::with_options(None, Config::default(), fast_options());
    assert_eq!(driver.connection_state().await, ConnectionState::NilBox);

    let connector = DemoConnector::new(demo.clone(), DEMO_PATH, fast_transport());
    let watcher = Watcher::spawn(driver.clone(), connector, watcher_config(None));
    wait_for_state(&driver, ConnectionState::Connected).await;

    // firmware is looked up by the following pings
    let deadline = Instant::now() + Duration::from_secs(5);
    while driver.firmware().await != Firmware::Known(DEMO_FIRMWARE.to_string()) {
        assert!(Instant::now() < deadline, "firmware never identified");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_device_is_never_scanned_for() {
    let demo = DemoBox::new();
    let driver = Driver::with_options(None, Config::default(), fast_options());
    let connector = DemoConnector::new(demo.clone(), DEMO_PATH, fast_transport());
    let watcher = Watcher::spawn(driver.clone(), connector, watcher_config(Some("/dev/ttyOTHER")));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(driver.connection_state().await, ConnectionState::NilBox);
    watcher.stop().await;

    let connector = DemoConnector::new(demo, DEMO_PATH, fast_transport());
    let watcher = Watcher::spawn(driver.clone(), connector, watcher_config(Some(DEMO_PATH)));
    wait_for_state(&driver, ConnectionState::Connected).await;
    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_survives_cable_loss() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(10);
    let config = Config {
        mode: BotMode::Charger,
        top_voltage: 1300,
        bottom_voltage: 1000,
        ticker: Duration::from_millis(10),
        up_duration: Duration::from_secs(10),
        ..Config::default()
    };
    let transport = demo.transport_at(DEMO_PATH, fast_transport()).pinned();
    let driver = Driver::with_options(Some(transport), config, fast_options());
    let connector = DemoConnector::new(demo.clone(), DEMO_PATH, fast_transport());
    let watcher = Watcher::spawn(driver.clone(), connector, watcher_config(None));

    let (mut snapshots, mut events) = driver.start().unwrap();
    tokio::spawn(async move { while snapshots.recv().await.is_some() {} });

    demo.unplug();
    tokio::time::sleep(Duration::from_millis(100)).await;
    demo.replug();

    let last = loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if msg.is_final {
            break msg;
        }
    };
    assert_eq!(last.status, "Target voltage reached");
    assert!(demo.voltages()[0] >= 1300);

    watcher.stop().await;
    driver.close().await;
    assert_eq!(driver.connection_state().await, ConnectionState::Disconnected);
}
