//! Shared types for the garage monitor

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch seconds
#[inline]
pub fn epoch_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Device identifier used as the partition key for door state and topic routing.
///
/// The value is opaque (the firmware sends its build date, e.g.
/// `"Sat Mar 13 14:45:00 2021"`) and is never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTimestamp(pub String);

impl BuildTimestamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Push topic for this device: `door_open-` followed by the build timestamp
    /// with every character outside `[A-Za-z0-9-_.~%]` replaced by `.`
    pub fn fcm_topic(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' | '%' => c,
                _ => '.',
            })
            .collect();
        format!("door_open-{sanitized}")
    }
}

impl fmt::Display for BuildTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reading of one binary door sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorReading {
    /// Sensor reports "0": the door is at this sensor's end stop
    Active,
    /// Sensor reports "1"
    Inactive,
    /// Missing or unrecognized value
    Unset,
}

impl SensorReading {
    /// Interpret the raw string the firmware sends. Never fails.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "0" => SensorReading::Active,
            "1" => SensorReading::Inactive,
            _ => SensorReading::Unset,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        *self == SensorReading::Active
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorReading::Active => "active",
            SensorReading::Inactive => "inactive",
            SensorReading::Unset => "unset",
        }
    }
}

/// One raw reading pair from a device ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSnapshot {
    /// Fires when the door is fully closed
    pub closed: SensorReading,
    /// Fires when the door is fully open
    pub open: SensorReading,
    /// Arrival time, seconds since epoch
    pub timestamp_seconds: i64,
}

impl SensorSnapshot {
    pub fn new(closed: SensorReading, open: SensorReading, timestamp_seconds: i64) -> Self {
        Self { closed, open, timestamp_seconds }
    }

    pub fn from_raw(closed: &str, open: &str, timestamp_seconds: i64) -> Self {
        Self::new(SensorReading::from_raw(closed), SensorReading::from_raw(open), timestamp_seconds)
    }

    #[inline]
    pub fn closed_confirmed(&self) -> bool {
        self.closed.is_active()
    }

    #[inline]
    pub fn open_confirmed(&self) -> bool {
        self.open.is_active()
    }

    /// Either sensor missing or unreadable
    pub fn has_unset(&self) -> bool {
        self.closed == SensorReading::Unset || self.open == SensorReading::Unset
    }
}

/// Discrete door state. Names are shared with the mobile clients and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DoorStateType {
    Unknown,
    ErrorSensorConflict,
    Closed,
    Closing,
    ClosingTooLong,
    Open,
    /// Reserved: clients understand it, the interpreter never produces it
    OpenMisaligned,
    Opening,
    OpeningTooLong,
}

impl DoorStateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorStateType::Unknown => "UNKNOWN",
            DoorStateType::ErrorSensorConflict => "ERROR_SENSOR_CONFLICT",
            DoorStateType::Closed => "CLOSED",
            DoorStateType::Closing => "CLOSING",
            DoorStateType::ClosingTooLong => "CLOSING_TOO_LONG",
            DoorStateType::Open => "OPEN",
            DoorStateType::OpenMisaligned => "OPEN_MISALIGNED",
            DoorStateType::Opening => "OPENING",
            DoorStateType::OpeningTooLong => "OPENING_TOO_LONG",
        }
    }
}

impl fmt::Display for DoorStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DoorStateType {
    type Err = std::convert::Infallible;

    /// Unrecognized names map to `Unknown`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ERROR_SENSOR_CONFLICT" => DoorStateType::ErrorSensorConflict,
            "CLOSED" => DoorStateType::Closed,
            "CLOSING" => DoorStateType::Closing,
            "CLOSING_TOO_LONG" => DoorStateType::ClosingTooLong,
            "OPEN" => DoorStateType::Open,
            "OPEN_MISALIGNED" => DoorStateType::OpenMisaligned,
            "OPENING" => DoorStateType::Opening,
            "OPENING_TOO_LONG" => DoorStateType::OpeningTooLong,
            _ => DoorStateType::Unknown,
        })
    }
}

/// Last-known discrete door state for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorEvent {
    #[serde(rename = "type")]
    pub state: DoorStateType,
    /// When this state began (not when it was last observed)
    pub timestamp_seconds: i64,
    pub message: String,
    /// Last time a ping confirmed this state without changing it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_timestamp_seconds: Option<i64>,
}

impl DoorEvent {
    pub fn new(state: DoorStateType, timestamp_seconds: i64, message: impl Into<String>) -> Self {
        Self { state, timestamp_seconds, message: message.into(), check_in_timestamp_seconds: None }
    }
}

/// Ping timestamp - epoch seconds or an RFC 3339 string
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochSeconds(i64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochSeconds(i64::try_from(value).unwrap_or(i64::MAX)))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochSeconds(value))
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochSeconds(value as i64))
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Raw ping as published by the door firmware
///
/// `sensorA` is the closed-position switch, `sensorB` the open-position switch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPing {
    #[serde(default)]
    pub build_timestamp: Option<String>,
    #[serde(default)]
    pub sensor_a: Option<String>,
    #[serde(default)]
    pub sensor_b: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp_seconds: TimestampValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_reading_from_raw() {
        assert_eq!(SensorReading::from_raw("0"), SensorReading::Active);
        assert_eq!(SensorReading::from_raw("1"), SensorReading::Inactive);
        assert_eq!(SensorReading::from_raw(" 0 "), SensorReading::Active);
        assert_eq!(SensorReading::from_raw(""), SensorReading::Unset);
        assert_eq!(SensorReading::from_raw("2"), SensorReading::Unset);
        assert_eq!(SensorReading::from_raw("open"), SensorReading::Unset);
    }

    #[test]
    fn test_fcm_topic() {
        let bt = BuildTimestamp::new("Sat Mar 13 14:45:00 2021");
        assert_eq!(bt.fcm_topic(), "door_open-Sat.Mar.13.14.45.00.2021");

        let bt = BuildTimestamp::new("abc-_.~%9");
        assert_eq!(bt.fcm_topic(), "door_open-abc-_.~%9");
    }

    #[test]
    fn test_door_state_type_from_str() {
        assert_eq!("OPEN".parse::<DoorStateType>().unwrap(), DoorStateType::Open);
        assert_eq!(
            "OPENING_TOO_LONG".parse::<DoorStateType>().unwrap(),
            DoorStateType::OpeningTooLong
        );
        assert_eq!("garbage".parse::<DoorStateType>().unwrap(), DoorStateType::Unknown);
    }

    #[test]
    fn test_door_event_json_shape() {
        let event = DoorEvent::new(DoorStateType::ErrorSensorConflict, 1725781091, "x");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ERROR_SENSOR_CONFLICT");
        assert_eq!(json["timestampSeconds"], 1725781091);
        assert!(json.get("checkInTimestampSeconds").is_none());

        let parsed: DoorEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_ping_timestamp_variants() {
        let ping: SensorPing = serde_json::from_str(
            r#"{"buildTimestamp": "b", "sensorA": "0", "sensorB": "1", "timestampSeconds": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(ping.timestamp_seconds, TimestampValue::EpochSeconds(1700000000));

        let ping: SensorPing =
            serde_json::from_str(r#"{"timestampSeconds": "2026-01-05T16:41:30+00:00"}"#).unwrap();
        assert!(matches!(ping.timestamp_seconds, TimestampValue::IsoString(_)));
        assert!(ping.build_timestamp.is_none());

        let ping: SensorPing = serde_json::from_str(r#"{"sensorA": "1"}"#).unwrap();
        assert_eq!(ping.timestamp_seconds, TimestampValue::None);
        assert!(ping.sensor_b.is_none());
    }
}
