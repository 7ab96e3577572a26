//! Door state storage
//!
//! Each device (keyed by build timestamp) has one "current" record and an
//! append-only history. `DoorStore` is the seam for a real backend; the
//! in-memory implementation is used by the service and the tests.
//!
//! Writes of the current event are compare-and-set on the stored event's
//! start timestamp, so two racing pings for the same device cannot both win.

use crate::domain::notification::DoorNotification;
use crate::domain::snooze::SnoozeRequest;
use crate::domain::types::{BuildTimestamp, DoorEvent, SensorSnapshot};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// History rows returned when the caller does not ask for a count
pub const DEFAULT_HISTORY_COUNT: usize = 12;

/// Current state of one device, as saved on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub build_timestamp: BuildTimestamp,
    #[serde(default)]
    pub previous_event: Option<DoorEvent>,
    pub current_event: DoorEvent,
}

/// Last alert sent for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub build_timestamp: BuildTimestamp,
    pub notified_event: DoorEvent,
    pub notification: DoorNotification,
}

/// Result of a compare-and-set save of the current event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The stored current event already starts at the new event's timestamp
    Duplicate,
    /// Another writer changed the current event since it was read
    Conflict,
}

pub trait DoorStore: Send + Sync {
    fn current_event(&self, key: &BuildTimestamp) -> anyhow::Result<Option<EventRecord>>;

    /// Save `record` as current and append it to history.
    ///
    /// `expected_timestamp` is the start of the current event the caller read
    /// (`None` if there was none).
    fn save_event(
        &self,
        record: EventRecord,
        expected_timestamp: Option<i64>,
        now_seconds: i64,
    ) -> anyhow::Result<SaveOutcome>;

    /// Stamp the current event with a check-in time without touching history.
    /// Returns the updated event, or `None` if the current event no longer
    /// starts at `expected_timestamp`.
    fn check_in(
        &self,
        key: &BuildTimestamp,
        expected_timestamp: i64,
        check_in_seconds: i64,
    ) -> anyhow::Result<Option<DoorEvent>>;

    /// Newest first
    fn event_history(
        &self,
        key: &BuildTimestamp,
        max_count: usize,
    ) -> anyhow::Result<Vec<EventRecord>>;

    fn recent_events(&self, key: &BuildTimestamp) -> anyhow::Result<Vec<EventRecord>> {
        self.event_history(key, DEFAULT_HISTORY_COUNT)
    }

    fn devices(&self) -> anyhow::Result<Vec<BuildTimestamp>>;

    /// Latest sensor reading received from the device
    fn last_snapshot(&self, key: &BuildTimestamp) -> anyhow::Result<Option<SensorSnapshot>>;

    fn save_snapshot(&self, key: &BuildTimestamp, snapshot: SensorSnapshot) -> anyhow::Result<()>;

    fn last_notification(&self, key: &BuildTimestamp)
        -> anyhow::Result<Option<NotificationRecord>>;

    fn save_notification(&self, record: NotificationRecord, now_seconds: i64)
        -> anyhow::Result<()>;

    fn snooze(&self, key: &BuildTimestamp) -> anyhow::Result<Option<SnoozeRequest>>;

    fn save_snooze(
        &self,
        key: &BuildTimestamp,
        request: SnoozeRequest,
        now_seconds: i64,
    ) -> anyhow::Result<()>;

    /// Delete event history saved before `cutoff_seconds`; count only on dry run
    fn delete_events_before(&self, cutoff_seconds: i64, dry_run: bool) -> anyhow::Result<usize>;

    fn delete_notifications_before(
        &self,
        cutoff_seconds: i64,
        dry_run: bool,
    ) -> anyhow::Result<usize>;
}

/// A stored row with its save time
#[derive(Debug, Clone)]
struct Stamped<T> {
    saved_at_seconds: i64,
    data: T,
}

impl<T> Stamped<T> {
    fn new(data: T, saved_at_seconds: i64) -> Self {
        Self { saved_at_seconds, data }
    }
}

/// Current-per-key plus append-only history
struct TimeSeries<T> {
    current: FxHashMap<BuildTimestamp, Stamped<T>>,
    all: Vec<(BuildTimestamp, Stamped<T>)>,
}

impl<T: Clone> TimeSeries<T> {
    fn new() -> Self {
        Self { current: FxHashMap::default(), all: Vec::new() }
    }

    fn current(&self, key: &BuildTimestamp) -> Option<&T> {
        self.current.get(key).map(|entry| &entry.data)
    }

    fn save(&mut self, key: BuildTimestamp, data: T, now_seconds: i64) {
        let entry = Stamped::new(data, now_seconds);
        self.all.push((key.clone(), entry.clone()));
        self.current.insert(key, entry);
    }

    fn recent(&self, key: &BuildTimestamp, max_count: usize) -> Vec<T> {
        self.all
            .iter()
            .rev()
            .filter(|(k, _)| k == key)
            .take(max_count)
            .map(|(_, entry)| entry.data.clone())
            .collect()
    }

    /// History only; current rows are never aged out
    fn delete_all_before(&mut self, cutoff_seconds: i64, dry_run: bool) -> usize {
        let before = self.all.len();
        if dry_run {
            return self.all.iter().filter(|(_, e)| e.saved_at_seconds < cutoff_seconds).count();
        }
        self.all.retain(|(_, e)| e.saved_at_seconds >= cutoff_seconds);
        before - self.all.len()
    }
}

/// In-process store
pub struct MemoryStore {
    events: Mutex<TimeSeries<EventRecord>>,
    notifications: Mutex<TimeSeries<NotificationRecord>>,
    snoozes: Mutex<FxHashMap<BuildTimestamp, SnoozeRequest>>,
    snapshots: Mutex<FxHashMap<BuildTimestamp, SensorSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(TimeSeries::new()),
            notifications: Mutex::new(TimeSeries::new()),
            snoozes: Mutex::new(FxHashMap::default()),
            snapshots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Replay an event row from the history log. Rows must arrive in write
    /// order; the last one per device becomes current.
    pub fn restore_event(&self, record: EventRecord, saved_at_seconds: i64) {
        let key = record.build_timestamp.clone();
        self.events.lock().save(key, record, saved_at_seconds);
    }

    pub fn restore_notification(&self, record: NotificationRecord, saved_at_seconds: i64) {
        let key = record.build_timestamp.clone();
        self.notifications.lock().save(key, record, saved_at_seconds);
    }

    /// Number of event history rows across all devices
    pub fn event_history_len(&self) -> usize {
        self.events.lock().all.len()
    }

    pub fn notification_history_len(&self) -> usize {
        self.notifications.lock().all.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DoorStore for MemoryStore {
    fn current_event(&self, key: &BuildTimestamp) -> anyhow::Result<Option<EventRecord>> {
        Ok(self.events.lock().current(key).cloned())
    }

    fn save_event(
        &self,
        record: EventRecord,
        expected_timestamp: Option<i64>,
        now_seconds: i64,
    ) -> anyhow::Result<SaveOutcome> {
        let mut events = self.events.lock();
        let stored_timestamp =
            events.current(&record.build_timestamp).map(|r| r.current_event.timestamp_seconds);

        if stored_timestamp == Some(record.current_event.timestamp_seconds) {
            return Ok(SaveOutcome::Duplicate);
        }
        if stored_timestamp != expected_timestamp {
            return Ok(SaveOutcome::Conflict);
        }

        let key = record.build_timestamp.clone();
        events.save(key, record, now_seconds);
        Ok(SaveOutcome::Saved)
    }

    fn check_in(
        &self,
        key: &BuildTimestamp,
        expected_timestamp: i64,
        check_in_seconds: i64,
    ) -> anyhow::Result<Option<DoorEvent>> {
        let mut events = self.events.lock();
        let Some(entry) = events.current.get_mut(key) else {
            return Ok(None);
        };
        let event = &mut entry.data.current_event;
        if event.timestamp_seconds != expected_timestamp {
            return Ok(None);
        }
        event.check_in_timestamp_seconds = Some(check_in_seconds);
        entry.saved_at_seconds = check_in_seconds;
        Ok(Some(event.clone()))
    }

    fn event_history(
        &self,
        key: &BuildTimestamp,
        max_count: usize,
    ) -> anyhow::Result<Vec<EventRecord>> {
        Ok(self.events.lock().recent(key, max_count))
    }

    fn devices(&self) -> anyhow::Result<Vec<BuildTimestamp>> {
        let mut keys: Vec<BuildTimestamp> = self.events.lock().current.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn last_snapshot(&self, key: &BuildTimestamp) -> anyhow::Result<Option<SensorSnapshot>> {
        Ok(self.snapshots.lock().get(key).copied())
    }

    fn save_snapshot(&self, key: &BuildTimestamp, snapshot: SensorSnapshot) -> anyhow::Result<()> {
        self.snapshots.lock().insert(key.clone(), snapshot);
        Ok(())
    }

    fn last_notification(
        &self,
        key: &BuildTimestamp,
    ) -> anyhow::Result<Option<NotificationRecord>> {
        Ok(self.notifications.lock().current(key).cloned())
    }

    fn save_notification(
        &self,
        record: NotificationRecord,
        now_seconds: i64,
    ) -> anyhow::Result<()> {
        let key = record.build_timestamp.clone();
        self.notifications.lock().save(key, record, now_seconds);
        Ok(())
    }

    fn snooze(&self, key: &BuildTimestamp) -> anyhow::Result<Option<SnoozeRequest>> {
        Ok(self.snoozes.lock().get(key).cloned())
    }

    fn save_snooze(
        &self,
        key: &BuildTimestamp,
        request: SnoozeRequest,
        _now_seconds: i64,
    ) -> anyhow::Result<()> {
        self.snoozes.lock().insert(key.clone(), request);
        Ok(())
    }

    fn delete_events_before(&self, cutoff_seconds: i64, dry_run: bool) -> anyhow::Result<usize> {
        Ok(self.events.lock().delete_all_before(cutoff_seconds, dry_run))
    }

    fn delete_notifications_before(
        &self,
        cutoff_seconds: i64,
        dry_run: bool,
    ) -> anyhow::Result<usize> {
        Ok(self.notifications.lock().delete_all_before(cutoff_seconds, dry_run))
    }
}
