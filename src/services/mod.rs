pub mod door_alerts;
pub mod event_updater;
pub mod retention;
pub mod store;

pub use door_alerts::{AlertOutcome, DoorAlertChecker, SnoozeCommand};
pub use event_updater::{EventUpdater, IngestEvent, UpdateOutcome};
pub use retention::{RetentionJob, RetentionSummary};
pub use store::{DoorStore, EventRecord, MemoryStore, NotificationRecord, SaveOutcome};
