//! End-to-end tests of a full agent session against a fake instrument.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use smu_agent::app::SmuApp;
use smu_agent::commands::Host;
use smu_agent::link::SourceMeasure;
use smu_agent::poller::PollerExit;
use smu_agent::recorder::{data_file_path, CSV_HEADERS};
use smu_agent::state::ConnectionState;

use common::{connected_link, test_settings, FakeSmuBehavior};

/// Host stub that records exit requests instead of quitting.
#[derive(Default)]
struct RecordingHost {
    exit_requested: AtomicBool,
}

impl Host for RecordingHost {
    fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn poll_cycle_publishes_measurement_and_status() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM10").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let measurement = app.state().latest().expect("poller published a sample");
    assert_eq!(measurement.voltage, 3.3);
    assert_eq!(measurement.current, 0.0521);
    assert_eq!(app.state().status(), ConnectionState::Connected);

    app.shutdown().await;
    assert_eq!(app.state().status(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn exhausted_reconnects_end_in_critical_disconnect() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM11").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link.clone());
    let poller = app.take_poller().expect("poller handle");

    // kill the link out from under the poller; the in-memory transport
    // cannot be reopened, so every reconnect attempt fails
    link.close().await;

    let exit = tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .expect("poller exited in time")
        .expect("poller task joined");
    assert_eq!(exit, PollerExit::CriticalDisconnect);
    assert_eq!(app.state().status(), ConnectionState::Failed);
    assert!(app
        .state()
        .messages()
        .iter()
        .any(|m| m.contains("CRITICAL")));

    app.shutdown().await;
}

#[tokio::test]
async fn vlimit_reaches_the_wire_and_the_history() {
    let (link, fake) = connected_link(FakeSmuBehavior::default(), "COM12").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link);
    let host = RecordingHost::default();

    app.interpret("vlimit 5.5", &host).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fake.received().iter().any(|c| c == ":SOUR:VOLT 5.5"));
    assert!(app
        .state()
        .messages()
        .iter()
        .any(|m| m.contains("Set Voltage: 5.5 V")));
    assert!(!host.exit_requested.load(Ordering::SeqCst));

    app.shutdown().await;
}

#[tokio::test]
async fn bad_command_input_lands_in_history_only() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM13").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link);
    let host = RecordingHost::default();

    app.interpret("vlimit", &host).await;
    app.interpret("vlimit abc", &host).await;
    app.interpret("frobnicate", &host).await;

    let messages = app.state().messages();
    assert!(messages.iter().any(|m| m.contains("Usage: vlimit")));
    assert!(messages.iter().any(|m| m.contains("Invalid number: 'abc'")));
    assert!(messages
        .iter()
        .any(|m| m.contains("Unknown command: 'frobnicate'")));

    app.shutdown().await;
}

#[tokio::test]
async fn exit_command_fires_the_host_callback() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM14").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link);
    let host = RecordingHost::default();

    app.interpret("exit", &host).await;
    assert!(host.exit_requested.load(Ordering::SeqCst));
    assert!(app.state().messages().iter().any(|m| m.contains("> exit")));

    app.shutdown().await;
}

#[tokio::test]
async fn recorder_writes_header_and_ordered_rows() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM15").await;
    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut settings = test_settings();
    settings.storage.data_dir = data_dir.path().to_path_buf();
    let app = SmuApp::with_link(&settings, link);
    let host = RecordingHost::default();

    app.interpret("logdata on", &host).await;
    assert!(app.recorder().is_enabled());
    tokio::time::sleep(Duration::from_millis(200)).await;
    app.interpret("logdata off", &host).await;
    assert!(!app.recorder().is_enabled());
    app.shutdown().await;

    let path = data_file_path(data_dir.path(), "COM15", Utc::now().date_naive());
    let contents = std::fs::read_to_string(&path).expect("data file exists");
    let lines: Vec<&str> = contents.lines().collect();

    assert!(lines.len() >= 2, "expected header plus rows, got {lines:?}");
    assert_eq!(lines[0], CSV_HEADERS.join(","));
    assert_eq!(
        lines.iter().filter(|l| l.starts_with("timestamp_utc")).count(),
        1,
        "header must appear exactly once"
    );

    let mut previous: Option<DateTime<Utc>> = None;
    for row in &lines[1..] {
        let mut fields = row.split(',');
        let stamp: DateTime<Utc> = fields
            .next()
            .and_then(|s| s.parse().ok())
            .expect("row timestamp parses");
        if let Some(previous) = previous {
            assert!(stamp >= previous, "rows out of order: {row}");
        }
        previous = Some(stamp);
        assert_eq!(fields.clone().count(), 3);
        assert_eq!(fields.nth(1), Some("3.3"));
    }
}

#[tokio::test]
async fn concurrent_poller_recorder_and_commands_share_the_wire_cleanly() {
    let (link, fake) = connected_link(FakeSmuBehavior::default(), "COM16").await;
    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut settings = test_settings();
    settings.storage.data_dir = data_dir.path().to_path_buf();
    let app = SmuApp::with_link(&settings, link.clone());
    let host = RecordingHost::default();

    app.interpret("logdata on", &host).await;
    for _ in 0..5 {
        app.interpret("vlimit 5.5", &host).await;
        app.interpret("mode?", &host).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    app.shutdown().await;

    // closing the link drops the host side; the device task then sees
    // EOF and exits, unless it already died asserting wire discipline
    fake.assert_clean_exit().await;
    assert!(app
        .state()
        .messages()
        .iter()
        .any(|m| m.contains("Limits -> V: 15 V, I: 1 A")));
}

#[tokio::test]
async fn shutdown_is_bounded_and_idempotent() {
    let (link, _fake) = connected_link(FakeSmuBehavior::default(), "COM17").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link.clone());
    let host = RecordingHost::default();
    app.interpret("logdata on", &host).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let started = Instant::now();
    app.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!link.is_connected().await);

    // a second shutdown must be a harmless no-op
    app.shutdown().await;
    assert_eq!(app.state().status(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn parse_failures_skip_samples_without_reconnecting() {
    let behavior = FakeSmuBehavior {
        voltage: "garbage".into(),
        ..FakeSmuBehavior::default()
    };
    let (link, _fake) = connected_link(behavior, "COM18").await;
    let settings = test_settings();
    let app = SmuApp::with_link(&settings, link.clone());

    tokio::time::sleep(Duration::from_millis(150)).await;

    // every sample fails to parse, but the link stays up and no
    // reconnect cycle starts
    assert!(app.state().latest().is_none());
    assert_eq!(app.state().status(), ConnectionState::Connected);
    assert!(link.is_connected().await);
    assert!(link.measure_current().await.is_ok());

    app.shutdown().await;
}
