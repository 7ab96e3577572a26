//! Door state interpreter
//!
//! Converts a raw two-sensor snapshot into the next discrete door event, given
//! the previous event for the same device. The function is pure: no clock, no
//! I/O, no shared state. It is safe to call concurrently for any device.
//!
//! Terminal readings (closed, open, both) are evaluated first and always win.
//! Only when neither end stop confirms does the previous event matter:
//!
//! ```text
//! none / UNKNOWN / ERROR_SENSOR_CONFLICT / OPEN_MISALIGNED -> UNKNOWN
//! CLOSED                                                  -> OPENING
//! OPEN                                                    -> CLOSING
//! CLOSING  (> 60s)                                        -> CLOSING_TOO_LONG
//! OPENING  (> 60s)                                        -> OPENING_TOO_LONG
//! *_TOO_LONG                                              -> stays
//! ```

use crate::domain::notification::format_duration;
use crate::domain::types::{DoorEvent, DoorStateType, SensorSnapshot};

/// Travel time after which a moving door is reported as stuck
pub const TOO_LONG_SECONDS: i64 = 60;

/// Compute the next door event.
///
/// Returns `None` when the classification equals `old_event`'s type; the caller
/// must then skip persistence and notification. The new event starts at
/// `now_seconds`.
pub fn next_event(
    old_event: Option<&DoorEvent>,
    snapshot: &SensorSnapshot,
    now_seconds: i64,
) -> Option<DoorEvent> {
    let state = match classify_terminal(snapshot) {
        Some(state) => state,
        None => transition(old_event, now_seconds)?,
    };

    if old_event.is_some_and(|old| old.state == state) {
        return None;
    }

    let elapsed_seconds = old_event.map_or(0, |old| now_seconds - old.timestamp_seconds);
    Some(DoorEvent::new(state, now_seconds, event_message(state, elapsed_seconds)))
}

/// States decided by the sensors alone
fn classify_terminal(snapshot: &SensorSnapshot) -> Option<DoorStateType> {
    match (snapshot.closed_confirmed(), snapshot.open_confirmed()) {
        (true, true) => Some(DoorStateType::ErrorSensorConflict),
        (true, false) => Some(DoorStateType::Closed),
        (false, true) => Some(DoorStateType::Open),
        (false, false) => None,
    }
}

/// Door between end stops (or sensors unset): derive from history.
/// `None` means stay in the previous state.
fn transition(old_event: Option<&DoorEvent>, now_seconds: i64) -> Option<DoorStateType> {
    let Some(old) = old_event else {
        return Some(DoorStateType::Unknown);
    };
    let elapsed_seconds = now_seconds - old.timestamp_seconds;

    match old.state {
        DoorStateType::Unknown
        | DoorStateType::ErrorSensorConflict
        | DoorStateType::OpenMisaligned => Some(DoorStateType::Unknown),
        DoorStateType::Closed => Some(DoorStateType::Opening),
        DoorStateType::Open => Some(DoorStateType::Closing),
        DoorStateType::Closing if elapsed_seconds > TOO_LONG_SECONDS => {
            Some(DoorStateType::ClosingTooLong)
        }
        DoorStateType::Opening if elapsed_seconds > TOO_LONG_SECONDS => {
            Some(DoorStateType::OpeningTooLong)
        }
        DoorStateType::Closing
        | DoorStateType::Opening
        | DoorStateType::ClosingTooLong
        | DoorStateType::OpeningTooLong => None,
    }
}

/// Human-readable message stored with the event.
///
/// `elapsed_seconds` is measured from the previous event's start, so stuck
/// states report how long the door has been travelling.
pub fn event_message(state: DoorStateType, elapsed_seconds: i64) -> String {
    match state {
        DoorStateType::Unknown => "No sensor data.".to_string(),
        DoorStateType::ErrorSensorConflict => {
            "The sensors say the door is both open and closed at the same time.".to_string()
        }
        DoorStateType::Closed => "The door is closed.".to_string(),
        DoorStateType::Closing => "The door is closing.".to_string(),
        DoorStateType::ClosingTooLong => {
            format!("The door did not close for more than {}.", format_duration(elapsed_seconds))
        }
        DoorStateType::Open => "The door is open.".to_string(),
        DoorStateType::OpenMisaligned => "The door is open but misaligned.".to_string(),
        DoorStateType::Opening => "The door is opening.".to_string(),
        DoorStateType::OpeningTooLong => {
            format!("The door did not open for more than {}.", format_duration(elapsed_seconds))
        }
    }
}
