use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::canonical::{contains_nul, to_canonical_vec};

pub const MAX_EVENT_NAME_CHARS: usize = 100;
pub const MAX_PROFILE_ID_CHARS: usize = 50;
pub const MAX_DEVICE_IP_CHARS: usize = 45;

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const SUPPORTED_YEARS: RangeInclusive<i32> = 1..=9999;

/// Reasons an event cannot be decoded or canonicalized. All of them are
/// permanent: redelivering the same bytes fails the same way.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("message has an empty payload")]
    EmptyPayload,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("envelope is missing a field or has a field of the wrong type: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("envelope contains a NUL character")]
    ContainsNul,
    #[error("failed to encode envelope canonically: {0}")]
    Encoding(#[source] serde_json::Error),
}

impl EventError {
    /// Short label used in metrics and discard headers.
    pub fn reason(&self) -> &'static str {
        match self {
            EventError::EmptyPayload => "empty_payload",
            EventError::InvalidJson(_) => "invalid_json",
            EventError::NotAnObject(_) => "not_an_object",
            EventError::InvalidEnvelope(_) => "invalid_envelope",
            EventError::InvalidField { .. } => "invalid_field",
            EventError::ContainsNul => "contains_nul",
            EventError::Encoding(_) => "encoding",
        }
    }
}

#[derive(Deserialize)]
struct WireEnvelope {
    event_name: String,
    event_datetime: String,
    #[serde(default)]
    profile_id: Option<String>,
    #[serde(default)]
    device_ip: Option<String>,
    #[serde(default = "empty_object")]
    raw_data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A decoded and validated event, plus the full document it was decoded from.
///
/// Keys outside the known fields are kept in the document and therefore take
/// part in the fingerprint and in the stored `raw_data`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_name: String,
    pub event_datetime: DateTime<Utc>,
    pub profile_id: Option<String>,
    pub device_ip: Option<String>,
    pub raw_data: Value,
    document: Value,
}

impl EventEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(EventError::EmptyPayload);
        }

        let document: Value = serde_json::from_slice(payload).map_err(EventError::InvalidJson)?;
        Self::from_document(document)
    }

    pub fn from_document(mut document: Value) -> Result<Self, EventError> {
        if !document.is_object() {
            return Err(EventError::NotAnObject(json_type_name(&document)));
        }
        if contains_nul(&document) {
            return Err(EventError::ContainsNul);
        }

        let wire = WireEnvelope::deserialize(&document).map_err(EventError::InvalidEnvelope)?;

        check_length("event_name", &wire.event_name, 1, MAX_EVENT_NAME_CHARS)?;
        if let Some(profile_id) = &wire.profile_id {
            check_length("profile_id", profile_id, 0, MAX_PROFILE_ID_CHARS)?;
        }
        if let Some(device_ip) = &wire.device_ip {
            check_length("device_ip", device_ip, 0, MAX_DEVICE_IP_CHARS)?;
        }
        let event_datetime = parse_event_datetime(&wire.event_datetime)?;

        if let Value::Object(map) = &mut document {
            map.entry("raw_data").or_insert_with(empty_object);
        }

        Ok(Self {
            event_name: wire.event_name,
            event_datetime,
            profile_id: wire.profile_id,
            device_ip: wire.device_ip,
            raw_data: wire.raw_data,
            document,
        })
    }

    /// The full decoded document, with `raw_data` defaulted when absent.
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EventError> {
        to_canonical_vec(&self.document).map_err(EventError::Encoding)
    }
}

fn check_length(field: &'static str, value: &str, min: usize, max: usize) -> Result<(), EventError> {
    let chars = value.chars().count();
    if chars < min || chars > max {
        return Err(EventError::InvalidField {
            field,
            reason: format!("length {chars} is outside {min}..={max}"),
        });
    }
    Ok(())
}

/// Accepts RFC 3339 timestamps, and naive timestamps which are taken as UTC.
/// Years outside `1..=9999` are rejected since the store cannot hold them.
pub fn parse_event_datetime(value: &str) -> Result<DateTime<Utc>, EventError> {
    let parsed = match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => NAIVE_DATETIME_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| EventError::InvalidField {
                field: "event_datetime",
                reason: format!("{value:?} is not an ISO-8601 timestamp"),
            })?,
    };

    if !SUPPORTED_YEARS.contains(&parsed.year()) {
        return Err(EventError::InvalidField {
            field: "event_datetime",
            reason: format!("year {} is outside {SUPPORTED_YEARS:?}", parsed.year()),
        });
    }
    Ok(parsed)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether a missing `profile_id` is filled in when the row is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProfileFallback {
    #[default]
    None,
    DeviceIp,
}

impl ProfileFallback {
    pub fn resolve(&self, envelope: &EventEnvelope) -> Option<String> {
        match self {
            ProfileFallback::None => envelope.profile_id.clone(),
            ProfileFallback::DeviceIp => envelope
                .profile_id
                .clone()
                .or_else(|| envelope.device_ip.clone()),
        }
    }
}

impl FromStr for ProfileFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ProfileFallback::None),
            "device_ip" => Ok(ProfileFallback::DeviceIp),
            other => Err(format!("unknown profile id fallback: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_decode_minimal_envelope() {
        let envelope = EventEnvelope::decode(
            br#"{"event_name":"video_play","event_datetime":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(envelope.event_name, "video_play");
        assert_eq!(
            envelope.event_datetime,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(envelope.profile_id, None);
        assert_eq!(envelope.device_ip, None);
        assert_eq!(envelope.raw_data, json!({}));
        assert_eq!(envelope.document()["raw_data"], json!({}));
    }

    #[test]
    fn test_decode_keeps_unknown_keys() {
        let envelope = EventEnvelope::decode(
            br#"{"event_name":"a","event_datetime":"2024-01-01T00:00:00Z","session":"s1"}"#,
        )
        .unwrap();

        assert_eq!(envelope.document()["session"], json!("s1"));
    }

    #[test]
    fn test_null_optional_fields_are_accepted() {
        let envelope = EventEnvelope::decode(
            br#"{"event_name":"a","event_datetime":"2024-01-01T00:00:00Z","profile_id":null,"device_ip":null,"raw_data":{"x":[1,2]}}"#,
        )
        .unwrap();

        assert_eq!(envelope.profile_id, None);
        assert_eq!(envelope.device_ip, None);
        assert_eq!(envelope.raw_data, json!({"x": [1, 2]}));
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"  \n" ; "whitespace")]
    fn test_empty_payloads_are_rejected(payload: &[u8]) {
        assert!(matches!(
            EventEnvelope::decode(payload),
            Err(EventError::EmptyPayload)
        ));
    }

    #[test_case(br#"{"event_name":"#, "invalid_json" ; "truncated json")]
    #[test_case(br#"[1,2]"#, "not_an_object" ; "array document")]
    #[test_case(br#""video_play""#, "not_an_object" ; "string document")]
    #[test_case(br#"{"event_datetime":"2024-01-01T00:00:00Z"}"#, "invalid_envelope" ; "missing event name")]
    #[test_case(br#"{"event_name":"a"}"#, "invalid_envelope" ; "missing datetime")]
    #[test_case(br#"{"event_name":7,"event_datetime":"2024-01-01T00:00:00Z"}"#, "invalid_envelope" ; "numeric event name")]
    #[test_case(br#"{"event_name":"","event_datetime":"2024-01-01T00:00:00Z"}"#, "invalid_field" ; "blank event name")]
    #[test_case(br#"{"event_name":"a","event_datetime":"last tuesday"}"#, "invalid_field" ; "unparseable datetime")]
    #[test_case(br#"{"event_name":"a","event_datetime":"-5000-01-01 00:00:00"}"#, "invalid_field" ; "datetime out of storable range")]
    #[test_case(br#"{"event_name":"a","event_datetime":"2024-01-01T00:00:00Z","raw_data":{"k":"\u0000"}}"#, "contains_nul" ; "nul in raw data")]
    fn test_malformed_payloads(payload: &[u8], reason: &str) {
        let err = EventEnvelope::decode(payload).unwrap_err();
        assert_eq!(err.reason(), reason, "unexpected error: {err}");
    }

    #[test]
    fn test_field_lengths_are_enforced() {
        let name = "n".repeat(MAX_EVENT_NAME_CHARS);
        let ok = json!({"event_name": name, "event_datetime": "2024-01-01T00:00:00Z"});
        assert!(EventEnvelope::from_document(ok).is_ok());

        let long_name = "n".repeat(MAX_EVENT_NAME_CHARS + 1);
        let too_long = json!({"event_name": long_name, "event_datetime": "2024-01-01T00:00:00Z"});
        assert!(matches!(
            EventEnvelope::from_document(too_long),
            Err(EventError::InvalidField { field: "event_name", .. })
        ));

        let long_profile = "p".repeat(MAX_PROFILE_ID_CHARS + 1);
        let too_long = json!({"event_name": "a", "event_datetime": "2024-01-01T00:00:00Z", "profile_id": long_profile});
        assert!(matches!(
            EventEnvelope::from_document(too_long),
            Err(EventError::InvalidField { field: "profile_id", .. })
        ));

        let long_ip = "1".repeat(MAX_DEVICE_IP_CHARS + 1);
        let too_long = json!({"event_name": "a", "event_datetime": "2024-01-01T00:00:00Z", "device_ip": long_ip});
        assert!(matches!(
            EventEnvelope::from_document(too_long),
            Err(EventError::InvalidField { field: "device_ip", .. })
        ));
    }

    #[test]
    fn test_lengths_count_characters_not_bytes() {
        // 100 two-byte characters still fit.
        let name = "é".repeat(MAX_EVENT_NAME_CHARS);
        let doc = json!({"event_name": name, "event_datetime": "2024-01-01T00:00:00Z"});
        assert!(EventEnvelope::from_document(doc).is_ok());
    }

    #[test_case("2024-01-01T00:00:00Z", (2024, 1, 1, 0, 0, 0) ; "rfc3339 zulu")]
    #[test_case("2024-01-01T02:00:00+02:00", (2024, 1, 1, 0, 0, 0) ; "rfc3339 offset")]
    #[test_case("2024-01-01T00:00:00", (2024, 1, 1, 0, 0, 0) ; "naive with t")]
    #[test_case("2024-06-30 12:30:45", (2024, 6, 30, 12, 30, 45) ; "naive with space")]
    #[test_case("2024-06-30 12:30:45.250", (2024, 6, 30, 12, 30, 45) ; "naive with fraction")]
    #[test_case("0001-01-01T00:00:00Z", (1, 1, 1, 0, 0, 0) ; "earliest year")]
    #[test_case("9999-12-31 23:59:59", (9999, 12, 31, 23, 59, 59) ; "latest year")]
    fn test_parse_event_datetime(input: &str, expected: (i32, u32, u32, u32, u32, u32)) {
        let (y, mo, d, h, mi, s) = expected;
        let parsed = parse_event_datetime(input).unwrap();
        assert_eq!(
            parsed.with_nanosecond(0).unwrap(),
            Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
        );
    }

    #[test_case("2024-13-01T00:00:00Z" ; "month out of range")]
    #[test_case("2024-01-01" ; "date only")]
    #[test_case("1704067200" ; "epoch seconds")]
    #[test_case("-5000-01-01T00:00:00" ; "negative year")]
    #[test_case("-5000-01-01 00:00:00" ; "negative year with space")]
    #[test_case("+12000-01-01T00:00:00" ; "five digit year")]
    #[test_case("0000-01-01T00:00:00Z" ; "year zero")]
    #[test_case("0001-01-01T00:00:00+01:00" ; "offset shifts into year zero")]
    fn test_parse_event_datetime_rejects(input: &str) {
        assert!(parse_event_datetime(input).is_err());
    }

    #[test]
    fn test_profile_fallback() {
        let envelope = EventEnvelope::from_document(json!({
            "event_name": "a",
            "event_datetime": "2024-01-01T00:00:00Z",
            "device_ip": "10.0.0.1",
        }))
        .unwrap();

        assert_eq!(ProfileFallback::None.resolve(&envelope), None);
        assert_eq!(
            ProfileFallback::DeviceIp.resolve(&envelope),
            Some("10.0.0.1".to_string())
        );

        let with_profile = EventEnvelope::from_document(json!({
            "event_name": "a",
            "event_datetime": "2024-01-01T00:00:00Z",
            "profile_id": "user_1",
            "device_ip": "10.0.0.1",
        }))
        .unwrap();
        assert_eq!(
            ProfileFallback::DeviceIp.resolve(&with_profile),
            Some("user_1".to_string())
        );
    }

    #[test_case("none", ProfileFallback::None)]
    #[test_case("device_ip", ProfileFallback::DeviceIp)]
    #[test_case(" DEVICE_IP ", ProfileFallback::DeviceIp)]
    fn test_profile_fallback_from_str(input: &str, expected: ProfileFallback) {
        assert_eq!(input.parse::<ProfileFallback>().unwrap(), expected);
    }
}
