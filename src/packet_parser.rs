//! Datagram decoding with progressive fallbacks.
//!
//! Trackers in the field ship firmware of varying quality: truncated UTF-8,
//! log noise wrapped around the JSON object, single-quoted pseudo-JSON. Each
//! fallback is attempted only when the previous one failed; a datagram that
//! survives none of them is dropped, never retried.

use anyhow::{Result, bail};
use serde_json::Value;
use std::net::SocketAddr;
use tracing::warn;

/// Substring from the first `{` to the last `}`, for payloads with garbage
/// before or after the JSON object. Returns the input unchanged when no
/// object boundaries are found.
fn extract_json_candidate(s: &str) -> &str {
    match (s.find('{'), s.rfind('}')) {
        (Some(start), Some(end)) if end > start => &s[start..=end],
        _ => s,
    }
}

/// Decode one UDP datagram into a JSON value.
///
/// Fallback chain:
/// 1. strict UTF-8 decode, then JSON
/// 2. lossy UTF-8 decode (invalid bytes replaced), then JSON
/// 3. outermost `{...}` substring, then JSON
/// 4. single quotes replaced with double quotes, then JSON
///
/// A leading byte-order mark is always stripped.
pub fn parse_datagram(data: &[u8], sender: SocketAddr) -> Result<Value> {
    let decoded = match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => {
            warn!("Replaced invalid UTF-8 bytes in datagram from {}", sender);
            metrics::counter!("udp.parser.lossy_decode").increment(1);
            String::from_utf8_lossy(data).into_owned()
        }
    };

    let json_str = decoded.trim().trim_start_matches('\u{feff}').trim();

    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Ok(value);
    }

    let candidate = extract_json_candidate(json_str);
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        warn!("Used JSON extraction fallback for datagram from {}", sender);
        metrics::counter!("udp.parser.extraction_fallback").increment(1);
        return Ok(value);
    }

    match serde_json::from_str::<Value>(&json_str.replace('\'', "\"")) {
        Ok(value) => {
            warn!("Used quote replacement fallback for datagram from {}", sender);
            metrics::counter!("udp.parser.quote_fallback").increment(1);
            Ok(value)
        }
        Err(e) => {
            bail!("JSON decode failed after all fallbacks from {}: {}", sender, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> SocketAddr {
        "192.168.1.50:9001".parse().unwrap()
    }

    #[test]
    fn test_plain_json() {
        let value = parse_datagram(br#"{"DeviceID": "test123", "Latitude": 10.5}"#, sender())
            .unwrap();
        assert_eq!(value["DeviceID"], "test123");
        assert_eq!(value["Latitude"], 10.5);
    }

    #[test]
    fn test_bom_is_stripped() {
        let payload = "\u{feff}{\"DeviceID\": \"bom\"}";
        let value = parse_datagram(payload.as_bytes(), sender()).unwrap();
        assert_eq!(value["DeviceID"], "bom");
    }

    #[test]
    fn test_garbage_around_object() {
        let value =
            parse_datagram(br#"boot[0]: {"DeviceID": "x1"} -- end of line"#, sender()).unwrap();
        assert_eq!(value["DeviceID"], "x1");
    }

    #[test]
    fn test_single_quote_fallback() {
        let value = parse_datagram(br#"{'DeviceID': 'q1', 'Latitude': 1.0}"#, sender()).unwrap();
        assert_eq!(value["DeviceID"], "q1");
    }

    #[test]
    fn test_invalid_utf8_recovered() {
        let mut payload = br#"{"DeviceID": "u1", "note": ""#.to_vec();
        payload.push(0xFF);
        payload.extend_from_slice(br#""}"#);
        let value = parse_datagram(&payload, sender()).unwrap();
        assert_eq!(value["DeviceID"], "u1");
    }

    #[test]
    fn test_unparseable_reports_sender() {
        let err = parse_datagram(b"not json at all", sender()).unwrap_err();
        assert!(err.to_string().contains("192.168.1.50:9001"));
    }

    #[test]
    fn test_extract_json_candidate_no_braces() {
        assert_eq!(extract_json_candidate("no json here"), "no json here");
        assert_eq!(extract_json_candidate("x{\"a\":1}y"), "{\"a\":1}");
    }
}
