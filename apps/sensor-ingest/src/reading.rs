use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike};
use serde::{Serialize, Serializer};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use std::fmt;
use std::str::FromStr;

/// Text layout shared by snapshots, the `sensor_data` table and the history API.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SensorType {
    Temperature,
    Humidity,
    Moisture,
    Other(String),
}

impl SensorType {
    pub fn as_str(&self) -> &str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Moisture => "moisture",
            SensorType::Other(name) => name,
        }
    }
}

impl FromStr for SensorType {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw {
            "temperature" => SensorType::Temperature,
            "humidity" => SensorType::Humidity,
            "moisture" => SensorType::Moisture,
            other => SensorType::Other(other.to_string()),
        })
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SensorType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One normalized observation. Never mutated after decode; consumers take clones.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub sensor_type: SensorType,
    pub location: String,
    pub value: f64,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: NaiveDateTime,
}

impl Reading {
    pub fn new(
        sensor_type: SensorType,
        location: impl Into<String>,
        value: f64,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            sensor_type,
            location: location.into(),
            value,
            timestamp: truncate_to_second(timestamp),
        }
    }

    pub fn timestamp_text(&self) -> String {
        format_timestamp(self.timestamp)
    }
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

pub fn local_now() -> NaiveDateTime {
    to_local_naive(Local::now())
}

pub fn to_local_naive<Tz: TimeZone>(ts: DateTime<Tz>) -> NaiveDateTime {
    truncate_to_second(ts.with_timezone(&Local).naive_local())
}

fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

fn serialize_timestamp<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(*ts))
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed topic {0:?}: expected sensor/<type>/<location>")]
    Topic(String),
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] simd_json::Error),
    #[error("invalid data format: missing numeric `value` field")]
    InvalidFormat,
    #[error("`value` is not a finite number")]
    NonNumericValue,
}

/// Splits `sensor/<type>/<location>`; segments past the third are ignored.
pub fn parse_topic(topic: &str) -> Result<(SensorType, &str), DecodeError> {
    let mut parts = topic.split('/');
    let _prefix = parts.next();
    let (Some(sensor_type), Some(location)) = (parts.next(), parts.next()) else {
        return Err(DecodeError::Topic(topic.to_string()));
    };
    let sensor_type = sensor_type.trim();
    let location = location.trim();
    if sensor_type.is_empty() || location.is_empty() {
        return Err(DecodeError::Topic(topic.to_string()));
    }
    let sensor_type = sensor_type
        .parse::<SensorType>()
        .unwrap_or_else(|never| match never {});
    Ok((sensor_type, location))
}

/// Decodes one bus message. `received_at` becomes the reading timestamp; any
/// timestamp carried in the payload is ignored.
pub fn parse_sensor_message(
    topic: &str,
    payload: &mut [u8],
    received_at: NaiveDateTime,
) -> Result<Reading, DecodeError> {
    let (sensor_type, location) = parse_topic(topic)?;
    std::str::from_utf8(payload)?;

    let parsed = simd_json::to_borrowed_value(payload)?;
    let BorrowedValue::Object(obj) = parsed else {
        return Err(DecodeError::InvalidFormat);
    };
    let raw = obj.get("value").ok_or(DecodeError::InvalidFormat)?;
    let value = raw
        .as_f64()
        .or_else(|| raw.as_i64().map(|v| v as f64))
        .or_else(|| raw.as_u64().map(|v| v as f64))
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|v| v.is_finite())
        .ok_or(DecodeError::NonNumericValue)?;

    Ok(Reading::new(sensor_type, location, value, received_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> NaiveDateTime {
        parse_timestamp("2025-03-01 12:30:45").unwrap()
    }

    #[test]
    fn decodes_value_from_topic_and_payload() {
        let mut payload = br#"{"value": 72.3}"#.to_vec();
        let reading =
            parse_sensor_message("sensor/temperature/livingroom", &mut payload, at()).unwrap();
        assert_eq!(reading.sensor_type, SensorType::Temperature);
        assert_eq!(reading.location, "livingroom");
        assert!((reading.value - 72.3).abs() < 1e-9);
        assert_eq!(reading.timestamp_text(), "2025-03-01 12:30:45");
    }

    #[test]
    fn payload_timestamp_is_ignored() {
        let mut payload = br#"{"value": 41, "timestamp": "1999-01-01 00:00:00"}"#.to_vec();
        let reading = parse_sensor_message("sensor/humidity/bedroom", &mut payload, at()).unwrap();
        assert_eq!(reading.value, 41.0);
        assert_eq!(reading.timestamp, at());
    }

    #[test]
    fn numeric_string_value_is_accepted() {
        let mut payload = br#"{"value": "512"}"#.to_vec();
        let reading = parse_sensor_message("sensor/moisture/plant1", &mut payload, at()).unwrap();
        assert_eq!(reading.value, 512.0);
    }

    #[test]
    fn missing_value_is_invalid_format() {
        let mut payload = br#"{"foo": 1}"#.to_vec();
        let err = parse_sensor_message("sensor/temperature/livingroom", &mut payload, at())
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat));
    }

    #[test]
    fn non_object_payload_is_invalid_format() {
        let mut payload = b"[1, 2, 3]".to_vec();
        let err = parse_sensor_message("sensor/temperature/livingroom", &mut payload, at())
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat));
    }

    #[test]
    fn malformed_json_is_reported() {
        let mut payload = b"{not json".to_vec();
        let err = parse_sensor_message("sensor/temperature/livingroom", &mut payload, at())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let mut payload = br#"{"value": true}"#.to_vec();
        let err = parse_sensor_message("sensor/temperature/livingroom", &mut payload, at())
            .unwrap_err();
        assert!(matches!(err, DecodeError::NonNumericValue));

        let mut payload = br#"{"value": "warm"}"#.to_vec();
        let err = parse_sensor_message("sensor/temperature/livingroom", &mut payload, at())
            .unwrap_err();
        assert!(matches!(err, DecodeError::NonNumericValue));
    }

    #[test]
    fn short_topic_is_rejected() {
        let mut payload = br#"{"value": 1.0}"#.to_vec();
        let err = parse_sensor_message("sensor/temperature", &mut payload, at()).unwrap_err();
        assert!(matches!(err, DecodeError::Topic(_)));

        assert!(parse_topic("sensor//livingroom").is_err());
        assert!(parse_topic("").is_err());
    }

    #[test]
    fn extra_topic_segments_are_ignored() {
        let (sensor_type, location) = parse_topic("sensor/moisture/jade_plant/raw").unwrap();
        assert_eq!(sensor_type, SensorType::Moisture);
        assert_eq!(location, "jade_plant");
    }

    #[test]
    fn unknown_sensor_type_round_trips_through_text() {
        let sensor_type: SensorType = "pressure".parse().unwrap();
        assert_eq!(sensor_type, SensorType::Other("pressure".to_string()));
        assert_eq!(sensor_type.to_string(), "pressure");
    }

    #[test]
    fn reading_serializes_with_text_timestamp() {
        let reading = Reading::new(SensorType::Humidity, "bedroom", 40.5, at());
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["sensor_type"], "humidity");
        assert_eq!(json["timestamp"], "2025-03-01 12:30:45");
    }
}
