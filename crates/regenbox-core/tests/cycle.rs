//! Cycle engine sessions against the simulated box

use pretty_assertions::assert_eq;
use regenbox_core::config::{BotMode, Config};
use regenbox_core::cycle::{CycleError, CycleKind, CycleMessage, EventStream, SnapshotStream};
use regenbox_core::demo::DemoBox;
use regenbox_core::driver::{ChargeState, Driver, DriverOptions};
use regenbox_core::hub::EventHub;
use regenbox_core::protocol::{Command, TransportConfig};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

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

fn base_config(mode: BotMode) -> Config {
    Config {
        mode,
        up_duration: Duration::from_secs(5),
        down_duration: Duration::from_secs(5),
        ticker: Duration::from_millis(10),
        top_voltage: 1300,
        bottom_voltage: 1100,
        ..Config::default()
    }
}

fn driver_for(demo: &DemoBox, config: Config) -> Driver {
    Driver::with_options(Some(demo.transport(fast_transport())), config, fast_options())
}

fn drain(mut snapshots: SnapshotStream) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut n = 0;
        while snapshots.recv().await.is_some() {
            n += 1;
        }
        n
    })
}

/// Collect events up to and including the final one, then check nothing follows it
async fn collect(mut events: EventStream) -> Vec<CycleMessage> {
    let mut out = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("session produced no final event in time")
            .expect("event stream closed before the final event");
        let last = msg.is_final;
        out.push(msg);
        if last {
            break;
        }
    }
    assert!(events.recv().await.is_none(), "event after the final one");
    out
}

fn statuses(events: &[CycleMessage]) -> Vec<&str> {
    events.iter().map(|e| e.status.as_str()).collect()
}

async fn wait_stopped(driver: &Driver) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !driver.stopped() {
        assert!(Instant::now() < deadline, "session never ended");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_charger_reaches_target() {
    let demo = DemoBox::new().with_voltage(1400);
    let driver = driver_for(&demo, base_config(BotMode::Charger));

    let (snapshots, events) = driver.start().unwrap();
    let drained = drain(snapshots);
    let events = collect(events).await;

    assert_eq!(statuses(&events), vec!["Started...", "Target voltage reached"]);
    let last = events.last().unwrap();
    assert_eq!(last.kind, CycleKind::Charge);
    assert_eq!(last.target, 1300);
    assert!(!last.erroneous);
    assert_eq!(drained.await.unwrap(), 1);

    wait_stopped(&driver).await;
    assert_eq!(demo.mode(), ChargeState::Idle);
    assert_eq!(driver.charge_state().await, ChargeState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_charger_follows_rising_voltage() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(25);
    let driver = driver_for(&demo, base_config(BotMode::Charger));

    let (snapshots, events) = driver.start().unwrap();
    let drained = drain(snapshots);
    let events = collect(events).await;

    assert_eq!(events.last().unwrap().status, "Target voltage reached");
    // 1225, 1250, 1275, 1300
    assert_eq!(drained.await.unwrap(), 4);
    assert!(demo.received().contains(&Command::ModeCharge));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discharger_times_out() {
    let demo = DemoBox::new().with_voltage(1000);
    let config = Config {
        bottom_voltage: 900,
        down_duration: Duration::from_millis(50),
        ..base_config(BotMode::Discharger)
    };
    let driver = driver_for(&demo, config);

    let started = Instant::now();
    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    let events = collect(events).await;
    let elapsed = started.elapsed();

    let last = events.last().unwrap();
    assert_eq!(last.kind, CycleKind::Discharge);
    assert_eq!(last.status, "Didn't reach target after 50ms");
    assert!(last.erroneous);
    assert!(last.error.is_some());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cycler_alternates_half_cycles() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(50);
    let config = Config {
        nb_half_cycles: 4,
        charge_first: true,
        ..base_config(BotMode::Cycler)
    };
    let driver = driver_for(&demo, config);

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    let events = collect(events).await;

    assert_eq!(
        statuses(&events),
        vec![
            "Started...",
            "Charge 1/4...",
            "Discharge 2/4...",
            "Charge 3/4...",
            "Discharge 4/4...",
            "Completed 4 half-cycles",
        ]
    );
    assert!(events.iter().all(|e| e.kind == CycleKind::MultiCycle));
    assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
    assert_eq!(events[1].target, 1300);
    assert_eq!(events[2].target, 1100);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cycler_can_start_with_discharge() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(50);
    let config = Config {
        nb_half_cycles: 2,
        charge_first: false,
        ..base_config(BotMode::Cycler)
    };
    let driver = driver_for(&demo, config);

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    let events = collect(events).await;

    assert_eq!(
        statuses(&events),
        vec![
            "Started...",
            "Discharge 1/2...",
            "Charge 2/2...",
            "Completed 2 half-cycles",
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cycler_reports_failing_half_cycle() {
    let demo = DemoBox::new().with_voltage(1200);
    let config = Config {
        nb_half_cycles: 4,
        up_duration: Duration::from_millis(40),
        ..base_config(BotMode::Cycler)
    };
    let driver = driver_for(&demo, config);

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    let events = collect(events).await;

    let last = events.last().unwrap();
    assert_eq!(last.status, "Charge 1/4 didn't reach target after 40ms");
    assert!(last.erroneous);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_charger_x4_first_slot_wins() {
    let demo = DemoBox::new().with_voltage(1200);
    demo.set_voltage(2, 1350);
    let config = Config {
        batteries: [false, true, true, false],
        ..base_config(BotMode::ChargerX4)
    };
    let driver = driver_for(&demo, config);

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    let events = collect(events).await;

    let last = events.last().unwrap();
    assert_eq!(last.kind, CycleKind::ChargeX4);
    assert_eq!(last.status, "Target voltage reached for battery #3...");

    let received = demo.received();
    assert!(received.contains(&Command::ModeChargeX4));
    assert!(received.contains(&Command::ReadVoltage2));
    assert!(!received.contains(&Command::ReadVoltage1));
    assert!(!received.contains(&Command::ReadVoltage4));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_while_running_is_rejected() {
    let demo = DemoBox::new().with_voltage(1200);
    let driver = driver_for(&demo, base_config(BotMode::Charger));

    let (snapshots, mut events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    assert_eq!(events.recv().await.unwrap().status, "Started...");

    assert!(matches!(driver.start(), Err(CycleError::AlreadyRunning)));
    assert!(matches!(
        driver.set_config(Config::default()),
        Err(CycleError::MustBeStopped)
    ));
    assert_eq!(driver.running_mode(), Some(BotMode::Charger));

    driver.stop().await;
    let rest = collect(events).await;
    assert_eq!(statuses(&rest), vec!["Stopped by user"]);
    assert!(!rest[0].erroneous);
    assert_eq!(demo.mode(), ChargeState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_idempotent() {
    let demo = DemoBox::new().with_voltage(1200);
    let driver = driver_for(&demo, base_config(BotMode::Discharger));

    // nothing running
    driver.stop().await;
    assert!(driver.stopped());

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    driver.stop().await;
    assert!(driver.stopped());

    let started = Instant::now();
    driver.stop().await;
    assert!(started.elapsed() < Duration::from_millis(50));

    let events = collect(events).await;
    assert_eq!(events.last().unwrap().status, "Stopped by user");

    // a new session can start once stopped
    driver.set_config(base_config(BotMode::Charger)).unwrap();
    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    driver.stop().await;
    assert_eq!(collect(events).await.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_counts_as_running_until_worker_exits() {
    let demo = DemoBox::new().with_voltage(1200);
    let options = DriverOptions {
        idle_backoff: Duration::from_millis(250),
        ..fast_options()
    };
    let driver = Driver::with_options(
        Some(demo.transport(fast_transport())),
        base_config(BotMode::Charger),
        options,
    );

    let (snapshots, mut events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    assert_eq!(events.recv().await.unwrap().status, "Started...");

    // idle restore now spends its backoff retrying
    demo.fail_writes(true);
    let stopping = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!stopping.is_finished());
    assert!(!driver.stopped());
    assert!(matches!(driver.start(), Err(CycleError::AlreadyRunning)));
    assert!(matches!(
        driver.set_config(base_config(BotMode::Discharger)),
        Err(CycleError::MustBeStopped)
    ));

    // abandoning the stop leaves the worker tracked
    stopping.abort();
    let _ = stopping.await;
    assert!(!driver.stopped());
    assert_eq!(driver.running_mode(), Some(BotMode::Charger));

    wait_stopped(&driver).await;
    let rest = collect(events).await;
    assert_eq!(statuses(&rest), vec!["Stopped by user"]);

    let started = Instant::now();
    driver.stop().await;
    assert!(started.elapsed() < Duration::from_millis(50));

    demo.fail_writes(false);
    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    driver.stop().await;
    assert!(driver.stopped());
    assert_eq!(collect(events).await.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_snapshot_consumer_aborts_session() {
    let demo = DemoBox::new().with_voltage(1200);
    let options = DriverOptions {
        publish_timeout: Duration::from_millis(100),
        ..fast_options()
    };
    let driver = Driver::with_options(
        Some(demo.transport(fast_transport())),
        base_config(BotMode::Charger),
        options,
    );

    let (_snapshots, events) = driver.start().unwrap();
    let events = collect(events).await;

    let last = events.last().unwrap();
    assert!(last.erroneous);
    assert!(last.status.contains("stalled"), "{}", last.status);
    wait_stopped(&driver).await;
    assert_eq!(demo.mode(), ChargeState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_snapshot_consumer_detaches() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(20);
    let driver = driver_for(&demo, base_config(BotMode::Charger));

    let (snapshots, events) = driver.start().unwrap();
    drop(snapshots);
    let events = collect(events).await;
    assert_eq!(events.last().unwrap().status, "Target voltage reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unread_event_stream_does_not_block_session() {
    let demo = DemoBox::new().with_voltage(1200).with_drift(100);
    let config = Config {
        nb_half_cycles: 40,
        ticker: Duration::from_millis(2),
        ..base_config(BotMode::Cycler)
    };
    let driver = driver_for(&demo, config);

    let (snapshots, mut events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    wait_stopped(&driver).await;

    let mut queued = Vec::new();
    while let Some(msg) = events.recv().await {
        queued.push(msg);
    }
    assert_eq!(queued.len(), 36);
    assert!(queued.iter().all(|e| !e.is_final));
    assert_eq!(demo.mode(), ChargeState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_without_box_skips_ticks() {
    let config = Config {
        up_duration: Duration::from_millis(60),
        ..base_config(BotMode::Charger)
    };
    let driver = Driver::with_options(None, config, fast_options());

    let (mut snapshots, events) = driver.start().unwrap();
    let events = collect(events).await;
    assert_eq!(
        events.last().unwrap().status,
        "Didn't reach target after 60ms"
    );
    assert!(snapshots.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_config_refuses_to_start() {
    let demo = DemoBox::new();
    let no_slots = Config {
        batteries: [false; 4],
        ..base_config(BotMode::ChargerX4)
    };
    let driver = driver_for(&demo, no_slots.clone());
    assert!(matches!(driver.start(), Err(CycleError::InvalidConfig(_))));
    assert!(driver.stopped());

    driver.set_config(base_config(BotMode::Charger)).unwrap();
    assert!(matches!(
        driver.set_config(no_slots),
        Err(CycleError::InvalidConfig(_))
    ));
    assert!(driver.start().is_ok());
    driver.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_fan_out_through_hub() {
    let demo = DemoBox::new().with_voltage(1400);
    let driver = driver_for(&demo, base_config(BotMode::Charger));
    let hub = EventHub::default();
    let (_, mut first) = hub.subscribe();
    let (_, mut second) = hub.subscribe();

    let (snapshots, events) = driver.start().unwrap();
    let _drained = drain(snapshots);
    hub.pump(events).await.unwrap();

    for rx in [&mut first, &mut second] {
        assert_eq!(rx.recv().await.unwrap().status, "Started...");
        assert!(rx.recv().await.unwrap().is_final);
    }
}
