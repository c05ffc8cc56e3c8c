//! Canonicalization of raw device payloads.
//!
//! Devices disagree on field names (`lat`, `Latitude`, `device_id`,
//! `DeviceID`) and on types (numbers arrive as strings, timestamps as UNIX
//! seconds, milliseconds, or ISO-8601). This module maps everything onto one
//! canonical GPS record and flattens the optional accelerometer block.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

/// Millisecond timestamps are ≥ 10^12 for any date after 2001; smaller
/// numeric values are interpreted as seconds.
const MILLIS_THRESHOLD: f64 = 1e12;

/// Canonical GPS record the rest of the pipeline operates on
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedGps {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Flattened accelerometer window, pre-validation
#[derive(Debug, Clone, PartialEq)]
pub struct AccelInput {
    pub device_id: String,
    /// Timestamp of the GPS fix this window accompanies
    pub timestamp: DateTime<Utc>,
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
    pub rms_x: f64,
    pub rms_y: f64,
    pub rms_z: f64,
    pub rms_mag: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub max_z: f64,
    pub max_mag: f64,
    pub peaks_count: i32,
    pub sample_count: i32,
    pub flags: i16,
}

/// Canonical field each accepted alias maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CanonicalKey {
    DeviceId,
    Latitude,
    Longitude,
    Altitude,
    Accuracy,
    Timestamp,
}

/// Alias lookup over lowercased, de-underscored key names
fn canonical_key(raw_key: &str) -> Option<CanonicalKey> {
    let folded: String = raw_key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();

    match folded.as_str() {
        "deviceid" | "device" | "id" | "imei" => Some(CanonicalKey::DeviceId),
        "latitude" | "lat" => Some(CanonicalKey::Latitude),
        "longitude" | "lon" | "lng" | "long" => Some(CanonicalKey::Longitude),
        "altitude" | "alt" => Some(CanonicalKey::Altitude),
        "accuracy" | "acc" => Some(CanonicalKey::Accuracy),
        "timestamp" | "time" | "ts" | "datetime" => Some(CanonicalKey::Timestamp),
        _ => None,
    }
}

/// Coerce a JSON number or numeric string to f64
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Normalize a timestamp value to a UTC instant.
///
/// Numbers (or numeric strings) are UNIX seconds below 10^12, milliseconds
/// above. ISO-8601 strings are accepted; naive ones are taken as UTC.
pub fn normalize_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    if let Some(n) = coerce_number(value) {
        let millis = if n.abs() < MILLIS_THRESHOLD {
            n * 1000.0
        } else {
            n
        };
        return Utc
            .timestamp_millis_opt(millis as i64)
            .single()
            .ok_or_else(|| anyhow!("timestamp out of range: {}", n));
    }

    if let Value::String(s) = value {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        // Naive ISO-8601: no offset means UTC
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        bail!("unrecognized timestamp format: {:?}", s);
    }

    bail!("timestamp must be a number or string, got {}", value)
}

/// Map a parsed payload onto the canonical GPS record.
///
/// Altitude and accuracy default to 0.0 when absent (the wire minimum is
/// device id + coordinates + timestamp); present-but-garbage values reject
/// the whole record.
pub fn normalize_gps_payload(raw: &Value) -> Result<NormalizedGps> {
    let object = raw
        .as_object()
        .ok_or_else(|| anyhow!("payload is not a JSON object"))?;

    let mut device_id: Option<String> = None;
    let mut latitude: Option<f64> = None;
    let mut longitude: Option<f64> = None;
    let mut altitude: f64 = 0.0;
    let mut accuracy: f64 = 0.0;
    let mut timestamp: Option<DateTime<Utc>> = None;

    for (key, value) in object {
        let Some(canonical) = canonical_key(key) else {
            continue;
        };
        match canonical {
            CanonicalKey::DeviceId => {
                device_id = Some(match value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    other => bail!("device id has unsupported type: {}", other),
                });
            }
            CanonicalKey::Latitude => {
                latitude =
                    Some(coerce_number(value).with_context(|| {
                        format!("latitude is not numeric: {}", value)
                    })?);
            }
            CanonicalKey::Longitude => {
                longitude =
                    Some(coerce_number(value).with_context(|| {
                        format!("longitude is not numeric: {}", value)
                    })?);
            }
            CanonicalKey::Altitude => {
                altitude = coerce_number(value)
                    .with_context(|| format!("altitude is not numeric: {}", value))?;
            }
            CanonicalKey::Accuracy => {
                accuracy = coerce_number(value)
                    .with_context(|| format!("accuracy is not numeric: {}", value))?;
            }
            CanonicalKey::Timestamp => {
                timestamp = Some(normalize_timestamp(value)?);
            }
        }
    }

    Ok(NormalizedGps {
        device_id: device_id.ok_or_else(|| anyhow!("missing device id"))?,
        latitude: latitude.ok_or_else(|| anyhow!("missing latitude"))?,
        longitude: longitude.ok_or_else(|| anyhow!("missing longitude"))?,
        altitude,
        accuracy,
        timestamp: timestamp.ok_or_else(|| anyhow!("missing timestamp"))?,
    })
}

fn sub_f64(block: &Value, group: &str, axis: &str) -> f64 {
    block
        .get(group)
        .and_then(|g| g.get(axis))
        .and_then(coerce_number)
        .unwrap_or(0.0)
}

fn sub_i64(block: &Value, key: &str, default: i64) -> Option<i64> {
    match block.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(v) => coerce_number(v).map(|n| n as i64),
    }
}

/// Flatten the optional top-level `accel` block into an [`AccelInput`].
///
/// Returns `None` when the block is absent or unusable; a broken
/// accelerometer window never blocks the GPS fix.
pub fn extract_accel_window(
    raw: &Value,
    device_id: &str,
    gps_timestamp: DateTime<Utc>,
) -> Option<AccelInput> {
    let accel = raw.get("accel")?;
    if accel.is_null() {
        return None;
    }

    let parse = || -> Result<AccelInput> {
        let ts_start = normalize_timestamp(
            accel.get("ts_start").ok_or_else(|| anyhow!("missing ts_start"))?,
        )?;
        let ts_end = normalize_timestamp(
            accel.get("ts_end").ok_or_else(|| anyhow!("missing ts_end"))?,
        )?;

        Ok(AccelInput {
            device_id: device_id.to_string(),
            timestamp: gps_timestamp,
            ts_start,
            ts_end,
            rms_x: sub_f64(accel, "rms", "x"),
            rms_y: sub_f64(accel, "rms", "y"),
            rms_z: sub_f64(accel, "rms", "z"),
            rms_mag: sub_f64(accel, "rms", "mag"),
            max_x: sub_f64(accel, "max", "x"),
            max_y: sub_f64(accel, "max", "y"),
            max_z: sub_f64(accel, "max", "z"),
            max_mag: sub_f64(accel, "max", "mag"),
            peaks_count: sub_i64(accel, "peaks_count", 0)
                .ok_or_else(|| anyhow!("peaks_count not numeric"))? as i32,
            sample_count: sub_i64(accel, "sample_count", 250)
                .ok_or_else(|| anyhow!("sample_count not numeric"))? as i32,
            flags: sub_i64(accel, "flags", 0)
                .ok_or_else(|| anyhow!("flags not numeric"))? as i16,
        })
    };

    match parse() {
        Ok(window) => Some(window),
        Err(e) => {
            warn!("Discarding accel block for {}: {}", device_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_alias_mapping_variants() {
        for payload in [
            json!({"DeviceID": "d1", "Latitude": 10.0, "Longitude": -74.0, "Timestamp": 1730000000}),
            json!({"device_id": "d1", "lat": 10.0, "lon": -74.0, "time": 1730000000}),
            json!({"deviceId": "d1", "LAT": 10.0, "lng": -74.0, "ts": 1730000000}),
        ] {
            let gps = normalize_gps_payload(&payload).unwrap();
            assert_eq!(gps.device_id, "d1");
            assert_eq!(gps.latitude, 10.0);
            assert_eq!(gps.longitude, -74.0);
        }
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let payload = json!({
            "DeviceID": "d1",
            "Latitude": "10.5",
            "Longitude": "-74.25",
            "Altitude": "100",
            "Accuracy": "5.0",
            "Timestamp": "1730000000"
        });
        let gps = normalize_gps_payload(&payload).unwrap();
        assert_eq!(gps.latitude, 10.5);
        assert_eq!(gps.longitude, -74.25);
        assert_eq!(gps.altitude, 100.0);
        assert_eq!(gps.accuracy, 5.0);
    }

    #[test]
    fn test_non_coercible_value_rejects_record() {
        let payload = json!({
            "DeviceID": "d1",
            "Latitude": "not-a-number",
            "Longitude": -74.0,
            "Timestamp": 1730000000
        });
        assert!(normalize_gps_payload(&payload).is_err());
    }

    #[test]
    fn test_missing_optional_fields_default_to_zero() {
        let payload = json!({
            "DeviceID": "d1",
            "Latitude": 1.0,
            "Longitude": 2.0,
            "Timestamp": 1730000000
        });
        let gps = normalize_gps_payload(&payload).unwrap();
        assert_eq!(gps.altitude, 0.0);
        assert_eq!(gps.accuracy, 0.0);
    }

    #[test]
    fn test_timestamp_unix_seconds() {
        let ts = normalize_timestamp(&json!(1730000000)).unwrap();
        assert_eq!(ts, Utc.timestamp_opt(1730000000, 0).unwrap());
    }

    #[test]
    fn test_timestamp_unix_millis() {
        let ts = normalize_timestamp(&json!(1730000000123_i64)).unwrap();
        assert_eq!(ts, Utc.timestamp_millis_opt(1730000000123).unwrap());
    }

    #[test]
    fn test_timestamp_iso_with_offset() {
        let ts = normalize_timestamp(&json!("2025-10-22T09:34:28Z")).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 10, 22, 9, 34, 28).unwrap());

        let offset = normalize_timestamp(&json!("2025-10-22T04:34:28-05:00")).unwrap();
        assert_eq!(offset, ts);
    }

    #[test]
    fn test_timestamp_naive_is_utc() {
        let ts = normalize_timestamp(&json!("2025-10-22T09:34:28")).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 10, 22, 9, 34, 28).unwrap());
    }

    #[test]
    fn test_timestamp_iso_round_trip() {
        // Normalizing a rendered UTC timestamp yields the same instant
        let instant = Utc.with_ymd_and_hms(2025, 3, 1, 18, 45, 12).unwrap();
        let rendered = crate::fixes::format_public_timestamp(instant);
        let parsed = normalize_timestamp(&json!(rendered)).unwrap();
        assert_eq!(parsed, instant);
    }

    #[test]
    fn test_accel_extraction_full_block() {
        let payload = json!({
            "DeviceID": "d1",
            "accel": {
                "ts_start": 1730000000,
                "ts_end": 1730000005,
                "rms": {"x": 0.5, "y": 0.3, "z": 0.8, "mag": 1.0},
                "max": {"x": 1.2, "y": 0.9, "z": 1.5, "mag": 2.1},
                "peaks_count": 5,
                "sample_count": 250,
                "flags": 0
            }
        });
        let gps_ts = Utc.timestamp_opt(1730000005, 0).unwrap();
        let window = extract_accel_window(&payload, "d1", gps_ts).unwrap();
        assert_eq!(window.rms_x, 0.5);
        assert_eq!(window.max_mag, 2.1);
        assert_eq!(window.peaks_count, 5);
        assert_eq!(window.sample_count, 250);
        assert_eq!(window.timestamp, gps_ts);
        assert_eq!(window.ts_end, gps_ts);
    }

    #[test]
    fn test_accel_missing_axes_default_zero() {
        let payload = json!({
            "accel": {
                "ts_start": 1730000000,
                "ts_end": 1730000005,
                "rms": {"x": 0.1}
            }
        });
        let gps_ts = Utc.timestamp_opt(1730000005, 0).unwrap();
        let window = extract_accel_window(&payload, "d1", gps_ts).unwrap();
        assert_eq!(window.rms_y, 0.0);
        assert_eq!(window.max_mag, 0.0);
        assert_eq!(window.sample_count, 250);
    }

    #[test]
    fn test_accel_absent_or_broken_returns_none() {
        let no_block = json!({"DeviceID": "d1"});
        let gps_ts = Utc.timestamp_opt(1730000005, 0).unwrap();
        assert!(extract_accel_window(&no_block, "d1", gps_ts).is_none());

        let missing_window = json!({"accel": {"rms": {"x": 1.0}}});
        assert!(extract_accel_window(&missing_window, "d1", gps_ts).is_none());
    }
}
