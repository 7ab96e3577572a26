//! Applies sensor pings to stored door state
//!
//! Reads the device's current event, asks the interpreter for the next one
//! and saves it with compare-and-set. A ping that does not change the state
//! refreshes the check-in time on the current record instead.
//!
//! The same task periodically re-evaluates every device from its last
//! reading, so a door that stops reporting mid-travel still escalates to
//! `*_TOO_LONG`.

use crate::domain::interpreter::next_event;
use crate::domain::notification::event_data_message;
use crate::domain::types::{epoch_seconds, BuildTimestamp, DoorEvent, SensorSnapshot};
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use crate::io::history_log::HistoryLog;
use crate::services::store::{DoorStore, EventRecord, SaveOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Retries after a concurrent write before giving up on a ping
const MAX_SAVE_ATTEMPTS: usize = 3;

/// A parsed ping ready to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestEvent {
    pub build_timestamp: BuildTimestamp,
    pub snapshot: SensorSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new event was saved as current and appended to history
    NewEvent,
    /// The stored current event already started at this timestamp
    DuplicateSkipped,
    /// State unchanged, check-in time refreshed
    CheckedIn,
    /// State unchanged on a scheduled re-evaluation
    Unchanged,
}

pub struct EventUpdater {
    store: Arc<dyn DoorStore>,
    metrics: Arc<Metrics>,
    egress: Option<EgressSender>,
    history: Option<HistoryLog>,
}

impl EventUpdater {
    pub fn new(store: Arc<dyn DoorStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics, egress: None, history: None }
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn with_history_log(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    /// Apply one snapshot to a device.
    ///
    /// `scheduled_job` marks re-evaluations that did not come from the device;
    /// those never count as a check-in.
    pub fn update(
        &self,
        build_timestamp: &BuildTimestamp,
        snapshot: &SensorSnapshot,
        now_seconds: i64,
        scheduled_job: bool,
    ) -> anyhow::Result<UpdateOutcome> {
        if !scheduled_job {
            self.store.save_snapshot(build_timestamp, *snapshot)?;
        }

        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let stored = self.store.current_event(build_timestamp)?;
            let old_event = stored.map(|record| record.current_event);

            let Some(new_event) = next_event(old_event.as_ref(), snapshot, now_seconds) else {
                return self.unchanged(build_timestamp, old_event.as_ref(), now_seconds, scheduled_job);
            };

            let expected = old_event.as_ref().map(|e| e.timestamp_seconds);
            let record = EventRecord {
                build_timestamp: build_timestamp.clone(),
                previous_event: old_event,
                current_event: new_event,
            };

            match self.store.save_event(record.clone(), expected, now_seconds)? {
                SaveOutcome::Saved => {
                    self.metrics.record_event_emitted();
                    info!(
                        build_timestamp = %build_timestamp,
                        state = %record.current_event.state,
                        previous = %record.previous_event.as_ref().map(|e| e.state.as_str()).unwrap_or("none"),
                        timestamp = %record.current_event.timestamp_seconds,
                        "door_event_emitted"
                    );
                    if let Some(ref history) = self.history {
                        history.write_event(&record, now_seconds);
                    }
                    if let Some(ref egress) = self.egress {
                        egress.send_event_update(
                            build_timestamp,
                            event_data_message(build_timestamp, &record.current_event),
                        );
                    }
                    return Ok(UpdateOutcome::NewEvent);
                }
                SaveOutcome::Duplicate => {
                    self.metrics.record_duplicate_skipped();
                    debug!(
                        build_timestamp = %build_timestamp,
                        timestamp = %record.current_event.timestamp_seconds,
                        "door_event_duplicate_skipped"
                    );
                    return Ok(UpdateOutcome::DuplicateSkipped);
                }
                SaveOutcome::Conflict => {
                    self.metrics.record_save_conflict();
                    debug!(build_timestamp = %build_timestamp, attempt = %attempt, "door_event_save_conflict");
                }
            }
        }

        anyhow::bail!(
            "current event for {build_timestamp} kept changing after {MAX_SAVE_ATTEMPTS} attempts"
        )
    }

    fn unchanged(
        &self,
        build_timestamp: &BuildTimestamp,
        old_event: Option<&DoorEvent>,
        now_seconds: i64,
        scheduled_job: bool,
    ) -> anyhow::Result<UpdateOutcome> {
        let Some(old_event) = old_event.filter(|_| !scheduled_job) else {
            self.metrics.record_unchanged();
            return Ok(UpdateOutcome::Unchanged);
        };

        let checked_in =
            self.store.check_in(build_timestamp, old_event.timestamp_seconds, now_seconds)?;
        let Some(event) = checked_in else {
            // Replaced between read and check-in; the newer writer sent its own update
            self.metrics.record_unchanged();
            return Ok(UpdateOutcome::Unchanged);
        };

        self.metrics.record_check_in();
        debug!(build_timestamp = %build_timestamp, state = %event.state, "door_check_in");
        if let Some(ref egress) = self.egress {
            egress.send_event_update(build_timestamp, event_data_message(build_timestamp, &event));
        }
        Ok(UpdateOutcome::CheckedIn)
    }

    /// Re-run the device's last reading at `now_seconds`.
    ///
    /// Returns `None` when there is no reading or a sensor was unset: an unset
    /// pair would read as movement and turn a closed door into `OPENING`.
    pub fn recheck_device(
        &self,
        build_timestamp: &BuildTimestamp,
        now_seconds: i64,
    ) -> anyhow::Result<Option<UpdateOutcome>> {
        let Some(last) = self.store.last_snapshot(build_timestamp)? else {
            return Ok(None);
        };
        if last.has_unset() {
            debug!(build_timestamp = %build_timestamp, "door_recheck_skipped_unset");
            return Ok(None);
        }
        let snapshot = SensorSnapshot::new(last.closed, last.open, now_seconds);
        self.update(build_timestamp, &snapshot, now_seconds, true).map(Some)
    }

    /// Re-evaluate every known device; a failing device does not stop the others
    pub fn recheck_all(&self, now_seconds: i64) -> anyhow::Result<usize> {
        let mut changed = 0;
        for build_timestamp in self.store.devices()? {
            match self.recheck_device(&build_timestamp, now_seconds) {
                Ok(Some(UpdateOutcome::NewEvent)) => changed += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        build_timestamp = %build_timestamp,
                        error = %format!("{e:#}"),
                        "door_recheck_failed"
                    );
                }
            }
        }
        Ok(changed)
    }

    /// Consume pings and run the periodic re-check until shutdown
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<IngestEvent>,
        recheck_interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut recheck = tokio::time::interval(Duration::from_secs(recheck_interval_secs.max(1)));
        info!(recheck_interval_secs = %recheck_interval_secs, "event_updater_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain remaining pings
                        while let Ok(ping) = rx.try_recv() {
                            self.apply(ping);
                        }
                        info!("event_updater_shutdown");
                        return;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(ping) => self.apply(ping),
                        None => {
                            warn!("ingest_channel_closed");
                            return;
                        }
                    }
                }
                _ = recheck.tick() => {
                    match self.recheck_all(epoch_seconds()) {
                        Ok(changed) if changed > 0 => info!(changed = %changed, "door_recheck_done"),
                        Ok(_) => {}
                        Err(e) => error!(error = %format!("{e:#}"), "door_recheck_failed"),
                    }
                }
            }
        }
    }

    fn apply(&self, ping: IngestEvent) {
        // Receive time, stamped by the MQTT client
        let now = ping.snapshot.timestamp_seconds;
        if let Err(e) = self.update(&ping.build_timestamp, &ping.snapshot, now, false) {
            error!(
                build_timestamp = %ping.build_timestamp,
                error = %format!("{e:#}"),
                "door_event_update_failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DoorStateType, SensorReading};
    use crate::io::egress_channel::{create_egress_channel, EgressMessage};
    use crate::services::store::MemoryStore;

    const T0: i64 = 1_725_781_091;

    fn snapshot(closed: &str, open: &str, ts: i64) -> SensorSnapshot {
        SensorSnapshot::from_raw(closed, open, ts)
    }

    fn setup() -> (Arc<MemoryStore>, Arc<Metrics>, EventUpdater) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let updater = EventUpdater::new(store.clone(), metrics.clone());
        (store, metrics, updater)
    }

    fn bt() -> BuildTimestamp {
        BuildTimestamp::new("Sat Mar 13 14:45:00 2021")
    }

    #[test]
    fn test_first_ping_saves_event() {
        let (store, metrics, updater) = setup();
        let outcome = updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        assert_eq!(outcome, UpdateOutcome::NewEvent);

        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.state, DoorStateType::Closed);
        assert_eq!(record.current_event.timestamp_seconds, T0);
        assert!(record.previous_event.is_none());
        assert_eq!(metrics.events_emitted(), 1);
    }

    #[test]
    fn test_transition_keeps_previous_event() {
        let (store, _, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        updater.update(&bt(), &snapshot("1", "1", T0 + 2), T0 + 2, false).unwrap();

        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.state, DoorStateType::Opening);
        assert_eq!(record.previous_event.map(|e| e.state), Some(DoorStateType::Closed));
        assert_eq!(store.event_history_len(), 2);
    }

    #[test]
    fn test_repeat_ping_checks_in() {
        let (store, metrics, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();

        let outcome = updater.update(&bt(), &snapshot("0", "1", T0 + 30), T0 + 30, false).unwrap();
        assert_eq!(outcome, UpdateOutcome::CheckedIn);

        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.timestamp_seconds, T0);
        assert_eq!(record.current_event.check_in_timestamp_seconds, Some(T0 + 30));
        assert_eq!(store.event_history_len(), 1);
        assert_eq!(metrics.report().checks_in, 1);
    }

    #[test]
    fn test_scheduled_job_never_checks_in() {
        let (store, metrics, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();

        let outcome = updater.update(&bt(), &snapshot("0", "1", T0 + 30), T0 + 30, true).unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        let record = store.current_event(&bt()).unwrap().unwrap();
        assert!(record.current_event.check_in_timestamp_seconds.is_none());
        assert_eq!(metrics.report().unchanged, 1);
    }

    #[test]
    fn test_unknown_first_ping_then_silence() {
        let (store, _, updater) = setup();
        // Neither sensor confirmed, no history: UNKNOWN
        let outcome = updater.update(&bt(), &snapshot("1", "1", T0), T0, false).unwrap();
        assert_eq!(outcome, UpdateOutcome::NewEvent);
        assert_eq!(
            store.current_event(&bt()).unwrap().unwrap().current_event.state,
            DoorStateType::Unknown
        );

        let outcome = updater.update(&bt(), &snapshot("1", "1", T0 + 5), T0 + 5, false).unwrap();
        assert_eq!(outcome, UpdateOutcome::CheckedIn);
    }

    #[test]
    fn test_duplicate_guard() {
        let (store, metrics, updater) = setup();
        // Another writer already stored CLOSED@T0; this updater's ping also yields CLOSED@T0
        store
            .save_event(
                EventRecord {
                    build_timestamp: bt(),
                    previous_event: None,
                    current_event: DoorEvent::new(DoorStateType::OpeningTooLong, T0, ""),
                },
                None,
                T0,
            )
            .unwrap();

        let outcome = updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        assert_eq!(outcome, UpdateOutcome::DuplicateSkipped);
        assert_eq!(store.event_history_len(), 1);
        assert_eq!(metrics.report().duplicates_skipped, 1);
    }

    #[test]
    fn test_too_long_is_emitted_once() {
        let (store, _, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        updater.update(&bt(), &snapshot("1", "1", T0 + 1), T0 + 1, false).unwrap();

        let outcome = updater.update(&bt(), &snapshot("1", "1", T0 + 70), T0 + 70, true).unwrap();
        assert_eq!(outcome, UpdateOutcome::NewEvent);
        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.state, DoorStateType::OpeningTooLong);

        let outcome = updater.update(&bt(), &snapshot("1", "1", T0 + 200), T0 + 200, true).unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(store.event_history_len(), 3);
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let (_, metrics, updater) = setup();
        let (sender, mut rx) = create_egress_channel(8, "home".to_string(), metrics);
        let updater = updater.with_egress(sender);

        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        updater.update(&bt(), &snapshot("0", "1", T0 + 9), T0 + 9, false).unwrap();

        let Some(EgressMessage::EventUpdate(first)) = rx.recv().await else {
            panic!("expected event update");
        };
        assert_eq!(first.message.data["type"], "CLOSED");
        assert!(!first.message.data.contains_key("checkInTimestampSeconds"));

        let Some(EgressMessage::EventUpdate(second)) = rx.recv().await else {
            panic!("expected check-in update");
        };
        assert_eq!(second.message.data["checkInTimestampSeconds"], (T0 + 9).to_string());
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let (store, _, updater) = setup();
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(IngestEvent {
            build_timestamp: bt(),
            snapshot: SensorSnapshot::new(SensorReading::Active, SensorReading::Inactive, T0),
        })
        .await
        .unwrap();

        let handle = tokio::spawn(updater.run(rx, 3600, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.state, DoorStateType::Closed);
    }

    #[test]
    fn test_recheck_escalates_silent_door() {
        let (store, _, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        updater.update(&bt(), &snapshot("1", "1", T0 + 5), T0 + 5, false).unwrap();

        // Still travelling: nothing changes and no check-in is recorded
        assert_eq!(updater.recheck_device(&bt(), T0 + 30).unwrap(), Some(UpdateOutcome::Unchanged));

        // No ping since T0 + 5
        assert_eq!(updater.recheck_all(T0 + 70).unwrap(), 1);
        let record = store.current_event(&bt()).unwrap().unwrap();
        assert_eq!(record.current_event.state, DoorStateType::OpeningTooLong);
        assert_eq!(record.current_event.timestamp_seconds, T0 + 70);
        assert!(record.current_event.check_in_timestamp_seconds.is_none());

        // The stored reading is still the device's, not the re-check's
        assert_eq!(store.last_snapshot(&bt()).unwrap().unwrap().timestamp_seconds, T0 + 5);
    }

    #[test]
    fn test_recheck_skips_unset_sensors() {
        let (store, _, updater) = setup();
        updater.update(&bt(), &snapshot("0", "1", T0), T0, false).unwrap();
        // Garbled ping: CLOSED -> OPENING
        updater.update(&bt(), &snapshot("", "1", T0 + 5), T0 + 5, false).unwrap();
        assert_eq!(store.event_history_len(), 2);

        assert_eq!(updater.recheck_device(&bt(), T0 + 300).unwrap(), None);
        assert_eq!(updater.recheck_all(T0 + 300).unwrap(), 0);
        assert_eq!(store.event_history_len(), 2);

        // Unknown device
        assert_eq!(updater.recheck_device(&BuildTimestamp::new("other"), T0).unwrap(), None);
    }
}
