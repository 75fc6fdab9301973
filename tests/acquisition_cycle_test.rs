//! End-to-end tests of a curing cycle against the mock transport and demo sequences.

use autoclave_daq::acquisition::{LoopKind, LoopOptions, LoopState};
use autoclave_daq::config::Settings;
use autoclave_daq::error::DaqError;
use autoclave_daq::notify::{try_recv_change, Change, Notification, Notifier};
use autoclave_daq::session::{CycleSession, SourceKind};
use autoclave_daq::source::{DemoSequence, RawSample, FAILED_READING, INACTIVE_READING};
use autoclave_daq::transport::{MockTransport, RegisterTransport};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

const CONFIG: &str = r#"
    [application]
    name = "Cycle Test"

    [link]
    port = "mock"

    [acquisition]
    sample_period_secs = 0.005
    panel_period_secs = 0.005
    poll_quantum_ms = 1
    core_temp_channel = 1
    pressure_channel = 2
    core_temp_setpoint = 52.5

    [[channels]]
    label = "Core"
    device_address = 1
    process_register = 0x1000
    setpoint_register = 0x0500
    setpoint_value = 1200
    decimal_point = 1
    active = true

    [[channels]]
    label = "Pressure"
    device_address = 2
    process_register = 0x1000
    setpoint_register = 0x0500
    setpoint_value = 600
    decimal_point = 1
    active = true
    scale = true
    input_low = 4.0
    input_high = 20.0
    output_low = 0.0
    output_high = 1000.0

    [[channels]]
    label = "Spare"
    device_address = 3
    process_register = 0x1000
    setpoint_register = 0x0500
"#;

fn settings() -> Arc<Settings> {
    Arc::new(Settings::from_toml_str(CONFIG).unwrap())
}

fn fast(ticks: u64) -> LoopOptions {
    LoopOptions::new(Duration::from_millis(5), Duration::from_millis(1)).with_tick_limit(ticks)
}

fn live_session(mock: &MockTransport) -> CycleSession {
    CycleSession::open(
        settings(),
        SourceKind::Live(Box::new(mock.clone())),
        Notifier::new(64),
    )
    .unwrap()
}

fn populated_mock() -> MockTransport {
    MockTransport::new()
        .with_register(1, 0x1000, 1234)
        .with_register(1, 0x0500, 1200)
        .with_register(2, 0x1000, 120)
        .with_register(2, 0x0500, 600)
}

#[test]
fn live_recording_scales_every_channel() {
    let mock = populated_mock();
    let mut session = live_session(&mock);
    session.start_recording_with(fast(2)).unwrap();
    session.wait_recording().unwrap();

    let store = session.store();
    assert_eq!(store.len(), 2);
    assert_eq!(store.channel(0), Some(vec![123.4, 123.4]));
    // 12.0 mA on a 4-20 mA range is half scale
    assert_eq!(store.channel(1), Some(vec![500.0, 500.0]));
    assert_eq!(store.channel(2), Some(vec![INACTIVE_READING, INACTIVE_READING]));
    assert_eq!(store.setpoints(0), Some(vec![Some(1200), Some(1200)]));
    assert_eq!(store.raw_channel(2), Some(vec![RawSample::Inactive; 2]));
}

#[test]
#[traced_test]
fn persistent_read_failure_keeps_the_loop_alive() {
    let mock = populated_mock();
    mock.fail_reads(2, 0x1000);
    let mut session = live_session(&mock);

    session.start_recording_with(fast(3)).unwrap();
    let report = session.wait_recording().unwrap().unwrap();

    assert_eq!(report.ticks, 3);
    let store = session.store();
    assert_eq!(store.len(), 3);
    assert_eq!(store.channel(1), Some(vec![FAILED_READING; 3]));
    assert_eq!(store.channel(0), Some(vec![123.4; 3]));
    assert_eq!(mock.counters().reconnects, 3);
    assert_eq!(session.recording_state(), Some(LoopState::Stopped));
    assert!(logs_contain("Failed to read channel"));
}

#[test]
fn link_open_failure_is_fatal_once() {
    let mock = MockTransport::new();
    mock.fail_open(true);
    let notifier = Notifier::new(8);
    let mut rx = notifier.subscribe();

    let result = CycleSession::open(
        settings(),
        SourceKind::Live(Box::new(mock.clone())),
        notifier.clone(),
    );

    assert!(matches!(result, Err(DaqError::Transport(_))));
    assert!(matches!(
        try_recv_change(&mut rx),
        Some(Change::Signal(Notification::FatalAcquisitionError(_)))
    ));
    assert_eq!(try_recv_change(&mut rx), None);
    assert_eq!(mock.counters().reads, 0);
}

#[test]
#[traced_test]
fn failed_reconnect_is_retried_until_the_link_recovers() {
    let mock = populated_mock();
    let mut session = live_session(&mock);
    mock.fail_open(true);
    mock.fail_reads(2, 0x1000);

    session
        .start_recording_with(LoopOptions::new(Duration::from_millis(5), Duration::from_millis(1)))
        .unwrap();
    let store = session.store();
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    let failing_rows = store.len();
    assert!(failing_rows >= 3);
    assert!(mock.counters().reconnects >= failing_rows);
    assert!(!mock.is_open());
    let pressure = store.channel(1).unwrap();
    assert!(pressure[..failing_rows].iter().all(|&v| v == FAILED_READING));
    assert!(logs_contain("Reconnect failed"));

    mock.fail_open(false);
    mock.restore_reads(2, 0x1000);
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.channel(1).unwrap().last() != Some(&500.0) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    let report = session.stop().unwrap();
    assert!(report.recording.is_some_and(|r| r.appended as usize > failing_rows));
    assert_eq!(store.channel(1).unwrap().last(), Some(&500.0));
    assert_eq!(store.channel(0).unwrap().last(), Some(&123.4));
    assert_eq!(session.recording_state(), Some(LoopState::Stopped));
}

#[test]
fn recording_start_on_dropped_link_is_fatal_once() {
    let mock = populated_mock();
    let mut session = live_session(&mock);
    let mut rx = session.subscribe();

    // A finished preview releases the only lease and closes the link.
    session.start_preview_with(fast(1)).unwrap();
    session.stop_preview().unwrap();
    assert!(!mock.is_open());

    mock.fail_open(true);
    let err = session.start_recording().unwrap_err();
    assert!(matches!(err, DaqError::Transport(_)));
    assert!(session.start_recording().is_err());
    assert_eq!(session.recording_state(), None);
    assert!(session.store().is_empty());

    let mut fatal = 0;
    while let Some(change) = try_recv_change(&mut rx) {
        if matches!(change, Change::Signal(Notification::FatalAcquisitionError(_))) {
            fatal += 1;
        }
    }
    assert_eq!(fatal, 1);
}

#[test]
fn preview_does_not_touch_the_store() {
    let mock = populated_mock();
    let mut session = live_session(&mock);

    session.start_preview_with(fast(3)).unwrap();
    let report = session.stop_preview();
    assert!(report.is_ok());

    assert!(session.store().is_empty());
    assert_eq!(session.events().dwell_minutes, None);
}

#[test]
fn preview_publishes_latest_values() {
    let mock = populated_mock();
    let mut session = live_session(&mock);

    session.start_preview_with(fast(2)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.preview_state() != Some(LoopState::Stopped) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }

    let latest = session.latest().unwrap();
    assert_eq!(latest.values, vec![123.4, 500.0, INACTIVE_READING]);
    assert!(session.store().is_empty());
}

#[test]
fn link_closes_when_last_loop_exits() {
    let mock = populated_mock();
    let mut session = live_session(&mock);

    session
        .start_preview_with(LoopOptions::new(Duration::from_millis(5), Duration::from_millis(1)))
        .unwrap();
    session.start_recording_with(fast(2)).unwrap();
    session.wait_recording().unwrap();
    assert!(mock.is_open());

    session.stop().unwrap();
    assert!(!mock.is_open());
    assert_eq!(mock.counters().closes, 1);
}

#[test]
fn setpoints_can_be_written_while_recording() {
    let mock = populated_mock();
    let mut session = live_session(&mock);

    session
        .start_recording_with(LoopOptions::new(Duration::from_millis(5), Duration::from_millis(1)))
        .unwrap();
    assert_eq!(session.write_setpoints().unwrap(), 2);
    assert!(mock.is_open());
    assert_eq!(mock.register(2, 0x0500), Some(600));

    std::thread::sleep(Duration::from_millis(30));
    let report = session.stop().unwrap();
    assert!(report.recording.is_some_and(|r| r.appended > 0));
    assert_eq!(session.store().len() as u64, report.recording.map_or(0, |r| r.appended));
}

#[test]
fn demo_cycle_detects_release_temperature() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "50,10,0").unwrap();
    writeln!(file, "51,10,0").unwrap();
    writeln!(file, "52,8,0").unwrap();
    writeln!(file, "53,9,0").unwrap();
    writeln!(file, "54,7,0").unwrap();
    let sequence = DemoSequence::from_csv(file.path()).unwrap();

    let notifier = Notifier::new(64);
    let mut rx = notifier.subscribe();
    let mut session = CycleSession::open(settings(), SourceKind::Demo(sequence), notifier).unwrap();
    session
        .start_recording_with(LoopOptions::new(Duration::from_millis(2), Duration::from_millis(1)))
        .unwrap();
    let report = session.wait_recording().unwrap().unwrap();

    assert_eq!(report.appended, 5);
    assert_eq!(session.recording_state(), Some(LoopState::Stopped));
    assert_eq!(session.store().channel(1), Some(vec![10.0, 10.0, 8.0, 9.0, 7.0]));

    let events = session.events();
    assert_eq!(events.release_temperature, Some(53.0));
    assert!(events.currently_above);

    let mut last_rows = 0;
    while let Some(change) = try_recv_change(&mut rx) {
        if let Change::Signal(Notification::BatchReady { kind, rows }) = change {
            assert_eq!(kind, LoopKind::Recording);
            assert!(rows > last_rows);
            last_rows = rows;
        }
    }
    assert_eq!(last_rows, 5);
}

#[test]
fn stop_request_is_honoured_promptly() {
    let sequence = DemoSequence::new(vec![vec![20.0, 0.0, 0.0]; 1000]);
    let mut session =
        CycleSession::open(settings(), SourceKind::Demo(sequence), Notifier::new(8)).unwrap();
    session
        .start_recording_with(LoopOptions::new(Duration::from_secs(60), Duration::from_millis(10)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.store().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    let requested = Instant::now();
    let report = session.stop().unwrap();
    assert!(requested.elapsed() < Duration::from_secs(1));
    assert_eq!(report.recording.map(|r| r.appended), Some(1));
    assert_eq!(session.recording_state(), Some(LoopState::Stopped));
}

#[test]
fn store_columns_match_row_count_throughout() {
    let sequence = DemoSequence::new((0..50).map(|i| vec![f64::from(i), 1.0, 2.0]).collect());
    let mut session =
        CycleSession::open(settings(), SourceKind::Demo(sequence), Notifier::new(8)).unwrap();
    let reader = session.store();
    session
        .start_recording_with(LoopOptions::new(Duration::from_millis(1), Duration::from_millis(1)))
        .unwrap();

    while session.recording_state() == Some(LoopState::Running) {
        let rows = reader.rows_from(0);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.index, i);
            assert_eq!(row.values.len(), 3);
        }
    }
    session.wait_recording().unwrap();
    assert_eq!(reader.len(), 50);
    assert_eq!(reader.elapsed_minutes().len(), 50);
    assert_eq!(reader.timestamps().len(), 50);
}
