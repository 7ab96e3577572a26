//! End-to-end ping sequences: MQTT payload -> event updater -> store -> alerts

use garage_monitor::domain::types::{BuildTimestamp, DoorStateType};
use garage_monitor::infra::Metrics;
use garage_monitor::io::mqtt::{parse_ping, parse_snooze_request};
use garage_monitor::io::{create_egress_channel, EgressMessage, HistoryLog};
use garage_monitor::services::{
    AlertOutcome, DoorAlertChecker, DoorStore, EventUpdater, MemoryStore, RetentionJob,
    UpdateOutcome,
};
use std::sync::Arc;
use tempfile::tempdir;

const DEVICE: &str = "Sat Mar 13 14:45:00 2021";
const T0: i64 = 1_725_781_091;

fn ping_json(closed: &str, open: &str) -> String {
    format!(r#"{{"buildTimestamp": "{DEVICE}", "sensorA": "{closed}", "sensorB": "{open}"}}"#)
}

struct Harness {
    store: Arc<MemoryStore>,
    metrics: Arc<Metrics>,
    updater: EventUpdater,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let updater = EventUpdater::new(store.clone(), metrics.clone());
        Self { store, metrics, updater }
    }

    fn ping(&self, closed: &str, open: &str, at: i64) -> UpdateOutcome {
        self.ping_json(&ping_json(closed, open), at)
    }

    /// Deliver a raw payload received at `at`, the way the updater task applies it
    fn ping_json(&self, json: &str, at: i64) -> UpdateOutcome {
        let ingest = parse_ping(json, at).unwrap();
        let now = ingest.snapshot.timestamp_seconds;
        self.updater.update(&ingest.build_timestamp, &ingest.snapshot, now, false).unwrap()
    }

    fn timeline(&self) -> Vec<(DoorStateType, i64)> {
        let mut history = self.store.event_history(&BuildTimestamp::new(DEVICE), 100).unwrap();
        history.reverse();
        history
            .into_iter()
            .map(|r| (r.current_event.state, r.current_event.timestamp_seconds))
            .collect()
    }

    fn states(&self) -> Vec<DoorStateType> {
        let mut history = self.store.event_history(&BuildTimestamp::new(DEVICE), 100).unwrap();
        history.reverse();
        history.into_iter().map(|r| r.current_event.state).collect()
    }
}

#[test]
fn test_open_close_cycle() {
    let h = Harness::new();
    h.ping("0", "1", T0);
    h.ping("1", "1", T0 + 2);
    h.ping("1", "1", T0 + 8);
    h.ping("1", "0", T0 + 14);
    h.ping("1", "0", T0 + 600);
    h.ping("1", "1", T0 + 700);
    h.ping("0", "1", T0 + 712);

    assert_eq!(
        h.states(),
        vec![
            DoorStateType::Closed,
            DoorStateType::Opening,
            DoorStateType::Open,
            DoorStateType::Closing,
            DoorStateType::Closed,
        ]
    );
    assert_eq!(h.metrics.report().events_emitted, 5);
    assert_eq!(h.metrics.report().checks_in, 2);
}

#[test]
fn test_repeated_identical_pings_one_history_entry() {
    let h = Harness::new();
    assert_eq!(h.ping("1", "0", T0), UpdateOutcome::NewEvent);
    for i in 1..50 {
        assert_eq!(h.ping("1", "0", T0 + i * 30), UpdateOutcome::CheckedIn);
    }
    assert_eq!(h.store.event_history_len(), 1);

    let current = h.store.current_event(&BuildTimestamp::new(DEVICE)).unwrap().unwrap();
    assert_eq!(current.current_event.timestamp_seconds, T0);
    assert_eq!(current.current_event.check_in_timestamp_seconds, Some(T0 + 49 * 30));
}

#[test]
fn test_stuck_door_reported_once() {
    let h = Harness::new();
    h.ping("1", "0", T0);
    h.ping("1", "1", T0 + 5);
    h.ping("1", "1", T0 + 50);
    h.ping("1", "1", T0 + 70);
    h.ping("1", "1", T0 + 500);

    assert_eq!(
        h.states(),
        vec![DoorStateType::Open, DoorStateType::Closing, DoorStateType::ClosingTooLong]
    );
    let current = h.store.current_event(&BuildTimestamp::new(DEVICE)).unwrap().unwrap();
    assert_eq!(current.current_event.message, "The door did not close for more than 1 minute.");
    assert_eq!(current.previous_event.map(|e| e.state), Some(DoorStateType::Closing));

    // Door finally closes
    h.ping("0", "1", T0 + 520);
    assert_eq!(h.states().last(), Some(&DoorStateType::Closed));
}

#[test]
fn test_late_device_timestamp_keeps_timeline_ordered() {
    let h = Harness::new();
    h.ping("0", "1", T0);
    h.ping("1", "0", T0 + 100);

    // Device clock lags: stamped +50, received at +110
    let late = format!(
        r#"{{"buildTimestamp": "{DEVICE}", "sensorA": "1", "sensorB": "1", "timestampSeconds": {}}}"#,
        T0 + 50
    );
    assert_eq!(h.ping_json(&late, T0 + 110), UpdateOutcome::NewEvent);

    // 20s into closing is not stuck
    assert_eq!(h.ping("1", "1", T0 + 130), UpdateOutcome::CheckedIn);

    let timeline = h.timeline();
    assert_eq!(
        timeline,
        vec![
            (DoorStateType::Closed, T0),
            (DoorStateType::Open, T0 + 100),
            (DoorStateType::Closing, T0 + 110),
        ]
    );
    assert!(timeline.windows(2).all(|pair| pair[0].1 <= pair[1].1));
}

#[test]
fn test_silent_closing_door_escalates_on_recheck() {
    let h = Harness::new();
    h.ping("1", "0", T0);
    h.ping("1", "1", T0 + 10);

    // Sensor goes quiet; only the scheduled re-check runs
    assert_eq!(h.updater.recheck_all(T0 + 40).unwrap(), 0);
    assert_eq!(h.updater.recheck_all(T0 + 80).unwrap(), 1);
    assert_eq!(h.updater.recheck_all(T0 + 140).unwrap(), 0);

    assert_eq!(
        h.timeline(),
        vec![
            (DoorStateType::Open, T0),
            (DoorStateType::Closing, T0 + 10),
            (DoorStateType::ClosingTooLong, T0 + 80),
        ]
    );
}

#[test]
fn test_sensor_conflict_and_recovery() {
    let h = Harness::new();
    h.ping("0", "0", T0);
    h.ping("1", "1", T0 + 10);
    h.ping("garbage", "", T0 + 20);
    h.ping("0", "1", T0 + 30);

    assert_eq!(
        h.states(),
        vec![DoorStateType::ErrorSensorConflict, DoorStateType::Unknown, DoorStateType::Closed]
    );
}

#[test]
fn test_open_door_alert_flow_with_history_log() {
    let dir = tempdir().unwrap();
    let history_path = dir.path().join("history.jsonl");
    let history_path = history_path.to_str().unwrap();

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let (egress, mut egress_rx) = create_egress_channel(16, "home".to_string(), metrics.clone());

    let updater = EventUpdater::new(store.clone(), metrics.clone())
        .with_egress(egress.clone())
        .with_history_log(HistoryLog::new(history_path));
    let alerts = DoorAlertChecker::new(store.clone(), metrics.clone(), true)
        .with_egress(egress)
        .with_history_log(HistoryLog::new(history_path));

    let device = BuildTimestamp::new(DEVICE);
    for (closed, open, at) in [("0", "1", T0), ("1", "1", T0 + 3), ("1", "0", T0 + 12)] {
        let ingest = parse_ping(&ping_json(closed, open), at).unwrap();
        updater.update(&ingest.build_timestamp, &ingest.snapshot, at, false).unwrap();
    }

    // Not old yet
    assert_eq!(alerts.check_device(&device, T0 + 600).unwrap(), AlertOutcome::NotOld);

    // Snoozed for an hour from T0 + 700, as a client would request it over MQTT
    let command = parse_snooze_request(&format!(
        r#"{{"buildTimestamp": "{DEVICE}", "eventTimestampSeconds": {}, "duration": "1h"}}"#,
        T0 + 12
    ))
    .unwrap();
    assert!(alerts.apply_snooze(&command, T0 + 700).is_some());
    assert_eq!(alerts.check_device(&device, T0 + 1000).unwrap(), AlertOutcome::Snoozed);

    let AlertOutcome::Sent(alert) = alerts.check_device(&device, T0 + 700 + 3601).unwrap() else {
        panic!("expected alert after snooze expired");
    };
    assert_eq!(alert.title, "Garage door open");
    assert_eq!(alert.body, "Open for more than 1 hour");
    assert_eq!(alert.topic, "door_open-Sat.Mar.13.14.45.00.2021");
    assert_eq!(
        alerts.check_device(&device, T0 + 9000).unwrap(),
        AlertOutcome::AlreadySent
    );

    let mut updates = 0;
    let mut notifications = 0;
    while let Ok(msg) = egress_rx.try_recv() {
        match msg {
            EgressMessage::EventUpdate(_) => updates += 1,
            EgressMessage::Notification(_) => notifications += 1,
        }
    }
    assert_eq!(updates, 3);
    assert_eq!(notifications, 1);

    let content = std::fs::read_to_string(history_path).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["kind"].to_string())
        .collect();
    assert_eq!(kinds, vec!["\"event\"", "\"event\"", "\"event\"", "\"notification\""]);
}

#[test]
fn test_retention_keeps_current_state() {
    let h = Harness::new();
    let day = 24 * 60 * 60;
    h.ping("0", "1", T0);
    h.ping("1", "1", T0 + 5);
    h.ping("1", "0", T0 + 20 * day);

    let job = RetentionJob::new(h.store.clone(), h.metrics.clone(), true, false, 14);
    let summary = job.run_once(T0 + 21 * day, false).unwrap().unwrap();
    assert_eq!(summary.events_deleted, 2);
    assert_eq!(h.states(), vec![DoorStateType::Open]);

    let current = h.store.current_event(&BuildTimestamp::new(DEVICE)).unwrap().unwrap();
    assert_eq!(current.current_event.state, DoorStateType::Open);
}

#[test]
fn test_restart_restores_state_from_history_log() {
    let dir = tempdir().unwrap();
    let history_path = dir.path().join("history.jsonl");
    let history = HistoryLog::new(history_path.to_str().unwrap());

    let h = Harness::new();
    let updater = EventUpdater::new(h.store.clone(), h.metrics.clone())
        .with_history_log(history.clone());
    for (closed, open, at) in [("0", "1", T0), ("1", "1", T0 + 3), ("1", "0", T0 + 12)] {
        let ingest = parse_ping(&ping_json(closed, open), at).unwrap();
        updater.update(&ingest.build_timestamp, &ingest.snapshot, at, false).unwrap();
    }

    // New process, same log
    let store = Arc::new(MemoryStore::new());
    assert_eq!(history.restore_into(&store).unwrap(), 3);
    let updater = EventUpdater::new(store.clone(), Arc::new(Metrics::new()))
        .with_history_log(history);

    let ingest = parse_ping(&ping_json("1", "0"), T0 + 60).unwrap();
    let outcome = updater.update(&ingest.build_timestamp, &ingest.snapshot, T0 + 60, false).unwrap();
    assert_eq!(outcome, UpdateOutcome::CheckedIn);
    assert_eq!(std::fs::read_to_string(&history_path).unwrap().lines().count(), 3);
}
