//! Snoozing door-open alerts
//!
//! A snooze is bound to one door event: it silences alerts for that event only,
//! so a new open after the door closes alerts again.

use crate::domain::types::DoorEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_SNOOZE_HOURS: u32 = 12;

const SECONDS_PER_HOUR: i64 = 60 * 60;

/// Whole-hour snooze duration, `"0h"` through `"12h"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoozeDuration {
    hours: u32,
}

impl SnoozeDuration {
    pub fn hours(&self) -> u32 {
        self.hours
    }

    pub fn as_seconds(&self) -> i64 {
        i64::from(self.hours) * SECONDS_PER_HOUR
    }
}

impl fmt::Display for SnoozeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.hours)
    }
}

impl std::str::FromStr for SnoozeDuration {
    type Err = SnoozeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SnoozeError::InvalidDuration(s.to_string());
        let digits = s.strip_suffix('h').ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: u32 = digits.parse().map_err(|_| invalid())?;
        if hours > MAX_SNOOZE_HOURS {
            return Err(invalid());
        }
        Ok(Self { hours })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnoozeError {
    /// The device has no current event to snooze
    NoCurrentEvent,
    /// The client snoozed an event that is no longer current
    EventMismatch { current: i64, requested: i64 },
    InvalidDuration(String),
}

impl fmt::Display for SnoozeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnoozeError::NoCurrentEvent => f.write_str("no current event"),
            SnoozeError::EventMismatch { current, requested } => write!(
                f,
                "snooze event timestamp {requested} does not match current event timestamp {current}"
            ),
            SnoozeError::InvalidDuration(value) => write!(
                f,
                "invalid snooze duration {value:?}, must be 0h through {MAX_SNOOZE_HOURS}h"
            ),
        }
    }
}

impl std::error::Error for SnoozeError {}

/// Stored snooze request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeRequest {
    /// Start of the event being snoozed
    pub current_event_timestamp_seconds: i64,
    pub snooze_request_seconds: i64,
    pub snooze_duration: String,
    pub snooze_end_time_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnoozeStatus {
    None,
    Active,
    Expired,
}

impl SnoozeRequest {
    /// Validate a client snooze request against the device's current event.
    pub fn submit(
        current_event: Option<&DoorEvent>,
        requested_event_timestamp_seconds: i64,
        duration: &str,
        now_seconds: i64,
    ) -> Result<Self, SnoozeError> {
        let current = current_event.ok_or(SnoozeError::NoCurrentEvent)?;
        if current.timestamp_seconds != requested_event_timestamp_seconds {
            return Err(SnoozeError::EventMismatch {
                current: current.timestamp_seconds,
                requested: requested_event_timestamp_seconds,
            });
        }
        let duration: SnoozeDuration = duration.parse()?;

        Ok(Self {
            current_event_timestamp_seconds: current.timestamp_seconds,
            snooze_request_seconds: now_seconds,
            snooze_duration: duration.to_string(),
            snooze_end_time_seconds: now_seconds + duration.as_seconds(),
        })
    }
}

/// Evaluate a stored snooze against the current event
pub fn snooze_status(
    request: Option<&SnoozeRequest>,
    current_event: Option<&DoorEvent>,
    now_seconds: i64,
) -> SnoozeStatus {
    let (Some(request), Some(current)) = (request, current_event) else {
        return SnoozeStatus::None;
    };
    if request.current_event_timestamp_seconds != current.timestamp_seconds {
        return SnoozeStatus::None;
    }
    if now_seconds > request.snooze_end_time_seconds {
        SnoozeStatus::Expired
    } else {
        SnoozeStatus::Active
    }
}
