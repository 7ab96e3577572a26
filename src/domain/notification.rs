//! Push payloads derived from door events
//!
//! Two kinds of message leave the service:
//! - a silent data update every time a device's current event is saved
//! - a user-visible "door not closed" alert once the current event is old

use crate::domain::types::{BuildTimestamp, DoorEvent, DoorStateType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Age after which a non-closed door is worth alerting about (15 minutes)
pub const TOO_LONG_OPEN_SECONDS: i64 = 15 * 60;

pub const EVENT_UPDATE_COLLAPSE_KEY: &str = "sensor_event_update";
pub const DOOR_NOT_CLOSED_COLLAPSE_KEY: &str = "door_not_closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    PriorityDefault,
    PriorityHigh,
    PriorityMax,
}

/// True when the event began more than 15 minutes ago and the door is not closed
pub fn is_event_old(event: &DoorEvent, now_seconds: i64) -> bool {
    event.state != DoorStateType::Closed
        && now_seconds - event.timestamp_seconds > TOO_LONG_OPEN_SECONDS
}

/// Whole minutes below an hour, whole hours above
pub fn format_duration(seconds: i64) -> String {
    let minutes = seconds.max(0) / 60;
    if minutes < 60 {
        plural(minutes, "minute")
    } else {
        plural(minutes / 60, "hour")
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Title and body of a user-visible alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
}

/// Alert text for a door that has been in `state` for `elapsed_seconds`.
/// `Closed` needs no alert.
pub fn notification_content(
    state: DoorStateType,
    elapsed_seconds: i64,
) -> Option<NotificationContent> {
    let duration = format_duration(elapsed_seconds);
    let (title, body) = match state {
        DoorStateType::Closed => return None,
        DoorStateType::Unknown => {
            ("Unknown door status", format!("Error not resolved for longer than {duration}"))
        }
        DoorStateType::ErrorSensorConflict => {
            ("Door error", format!("Door error for longer than {duration}"))
        }
        DoorStateType::OpenMisaligned => {
            ("Unknown door status", format!("Door error for longer than {duration}"))
        }
        DoorStateType::Closing | DoorStateType::ClosingTooLong => {
            ("Door not closed", format!("Door did not close for more than {duration}"))
        }
        DoorStateType::Open => {
            ("Garage door open", format!("Open for more than {duration}"))
        }
        DoorStateType::Opening | DoorStateType::OpeningTooLong => {
            ("Door not closed", format!("Door not closed for more than {duration}"))
        }
    };
    Some(NotificationContent { title: title.to_string(), body })
}

/// User-visible alert addressed to a device topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorNotification {
    pub topic: String,
    pub collapse_key: String,
    pub priority: MessagePriority,
    pub notification_priority: NotificationPriority,
    pub title: String,
    pub body: String,
    /// Start of the event this alert is about; used to send one alert per state
    pub event_timestamp_seconds: i64,
}

/// Build the "door not closed" alert, or `None` if the door is closed.
///
/// Does not check staleness; pair with [`is_event_old`].
pub fn door_not_closed_notification(
    build_timestamp: &BuildTimestamp,
    event: &DoorEvent,
    now_seconds: i64,
) -> Option<DoorNotification> {
    let content = notification_content(event.state, now_seconds - event.timestamp_seconds)?;
    Some(DoorNotification {
        topic: build_timestamp.fcm_topic(),
        collapse_key: DOOR_NOT_CLOSED_COLLAPSE_KEY.to_string(),
        priority: MessagePriority::High,
        notification_priority: NotificationPriority::PriorityMax,
        title: content.title,
        body: content.body,
        event_timestamp_seconds: event.timestamp_seconds,
    })
}

/// Silent data update carrying the current event as string fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDataMessage {
    pub topic: String,
    pub collapse_key: String,
    pub priority: MessagePriority,
    pub data: BTreeMap<String, String>,
}

pub fn event_data_message(build_timestamp: &BuildTimestamp, event: &DoorEvent) -> EventDataMessage {
    let mut data = BTreeMap::new();
    data.insert("type".to_string(), event.state.as_str().to_string());
    data.insert("timestampSeconds".to_string(), event.timestamp_seconds.to_string());
    data.insert("message".to_string(), event.message.clone());
    if let Some(check_in) = event.check_in_timestamp_seconds {
        data.insert("checkInTimestampSeconds".to_string(), check_in.to_string());
    }
    EventDataMessage {
        topic: build_timestamp.fcm_topic(),
        collapse_key: EVENT_UPDATE_COLLAPSE_KEY.to_string(),
        priority: MessagePriority::High,
        data,
    }
}
