//! Decoding of raw store payloads into validated samples
//!
//! Store values arrive with optional, misspelled, or string-typed fields.
//! Everything is coerced here so the rest of the crate only sees
//! `LocationSample` and `StatusEvent`.

use crate::domain::geo::Coordinate;
use crate::domain::types::{DeliveryStatus, LocationSample, StatusEvent};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const MIN_ACCURACY_M: f64 = 1.0;
const MAX_ACCURACY_M: f64 = 50.0;
const DEFAULT_ACCURACY_M: f64 = 10.0;

/// Epoch values below this are interpreted as seconds
const EPOCH_SECONDS_CUTOFF: u64 = 10_000_000_000;

/// Timestamp that can be either ISO 8601 string or epoch number
#[derive(Debug, Clone, Default)]
enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    Epoch(u64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or numeric timestamp")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<TimestampValue, E> {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<TimestampValue, E> {
            Ok(TimestampValue::Epoch(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<TimestampValue, E> {
            Ok(TimestampValue::Epoch(u64::try_from(value).unwrap_or(0)))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<TimestampValue, E> {
            if value.is_finite() && value >= 0.0 {
                Ok(TimestampValue::Epoch(value as u64))
            } else {
                Ok(TimestampValue::None)
            }
        }

        fn visit_unit<E: de::Error>(self) -> Result<TimestampValue, E> {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Number that may have been written as a string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LenientNumber {
    Float(f64),
    Text(String),
}

impl LenientNumber {
    fn value(&self) -> Option<f64> {
        let value = match self {
            LenientNumber::Float(v) => Some(*v),
            LenientNumber::Text(s) => s.trim().parse::<f64>().ok(),
        };
        value.filter(|v| v.is_finite())
    }
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(alias = "lat")]
    latitude: Option<LenientNumber>,
    #[serde(alias = "lng", alias = "lon")]
    longitude: Option<LenientNumber>,
    accuracy: Option<LenientNumber>,
    speed: Option<LenientNumber>,
    #[serde(alias = "bearing")]
    heading: Option<LenientNumber>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    timestamp: TimestampValue,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    status: Option<String>,
    #[serde(default, alias = "updatedAt", deserialize_with = "deserialize_timestamp")]
    timestamp: TimestampValue,
}

fn timestamp_ms(ts: &TimestampValue, now_ms: u64) -> u64 {
    let ms = match ts {
        TimestampValue::Epoch(v) if *v < EPOCH_SECONDS_CUTOFF => v.saturating_mul(1000),
        TimestampValue::Epoch(v) => *v,
        TimestampValue::IsoString(s) => parse_iso_time(s).unwrap_or(0),
        TimestampValue::None => 0,
    };
    if ms == 0 {
        now_ms
    } else {
        ms
    }
}

fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

/// Decode a raw location payload.
///
/// Returns `None` for malformed, non-finite, out-of-range, or (0, 0)
/// coordinates. Such samples are dropped rather than reported.
pub fn decode_location(value: &Value, now_ms: u64) -> Option<LocationSample> {
    let raw = RawLocation::deserialize(value).ok()?;
    let latitude = raw.latitude.as_ref().and_then(LenientNumber::value)?;
    let longitude = raw.longitude.as_ref().and_then(LenientNumber::value)?;

    if !Coordinate::new(latitude, longitude).is_valid() || (latitude == 0.0 && longitude == 0.0) {
        return None;
    }

    let accuracy_m = raw
        .accuracy
        .as_ref()
        .and_then(LenientNumber::value)
        .unwrap_or(DEFAULT_ACCURACY_M)
        .clamp(MIN_ACCURACY_M, MAX_ACCURACY_M);
    let speed_mps = raw.speed.as_ref().and_then(LenientNumber::value).unwrap_or(0.0).max(0.0);
    let heading_deg = raw
        .heading
        .as_ref()
        .and_then(LenientNumber::value)
        .map(|h| h.rem_euclid(360.0))
        .unwrap_or(0.0);

    Some(LocationSample {
        latitude,
        longitude,
        accuracy_m,
        speed_mps,
        heading_deg,
        timestamp_ms: timestamp_ms(&raw.timestamp, now_ms),
    })
}

/// Decode a raw status payload: either a bare label string or an object
/// carrying `status` and an optional timestamp.
pub fn decode_status(value: &Value, now_ms: u64) -> Option<StatusEvent> {
    let (label, ts) = match value {
        Value::String(s) => (s.clone(), TimestampValue::None),
        Value::Object(_) => {
            let raw = RawStatus::deserialize(value).ok()?;
            (raw.status?, raw.timestamp)
        }
        _ => return None,
    };

    if label.trim().is_empty() {
        return None;
    }

    Some(StatusEvent {
        status: label.parse().unwrap_or(DeliveryStatus::Other(label)),
        timestamp_ms: timestamp_ms(&ts, now_ms),
    })
}
