//! End-to-end coverage of the datagram pipeline up to the persistence
//! boundary: parse, normalize, validate, then drive the trip decision
//! matrix through the documented scenarios. Database-backed steps are
//! covered by their own modules; here the state machine is fed directly.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use fleetrack::normalizer::{extract_accel_window, normalize_gps_payload};
use fleetrack::packet_parser::parse_datagram;
use fleetrack::trip_tracker::{
    ActiveTrip, CompactFix, DeviceState, TripDecision, TripParams, evaluate,
};
use fleetrack::trips::TripType;
use fleetrack::validator::{validate_accel, validate_gps};

fn sender() -> std::net::SocketAddr {
    "10.0.0.7:9001".parse().unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
}

/// Degrees of longitude at the equator for a given ground distance
fn degrees_for_meters(m: f64) -> f64 {
    m / 111_195.0
}

/// Feed one fix through the decision matrix and mutate the state the way
/// the tracker does after a successful persist
fn step(state: &mut DeviceState, lat: f64, lon: f64, at: DateTime<Utc>) -> TripDecision {
    let evaluation = evaluate(state, lat, lon, &TripParams::default());

    // Trip bookkeeping mirrors lifecycle::apply_decision
    let seq = state.active_trip.as_ref().map(|_| 2).unwrap_or(1);
    match evaluation.decision {
        TripDecision::CreateMovementTrip | TripDecision::CloseAndCreate | TripDecision::CloseParking => {
            state.active_trip = Some(ActiveTrip {
                trip_id: format!("TRIP_20250310_D1_{:03}", seq),
                trip_type: TripType::Movement,
                start_time: at,
            });
        }
        TripDecision::CreateParkingTrip => {
            state.active_trip = Some(ActiveTrip {
                trip_id: format!("PARKING_20250310_D1_{:03}", 1),
                trip_type: TripType::Parking,
                start_time: at,
            });
        }
        TripDecision::AssociateExisting | TripDecision::IncrementStillCounter => {}
    }

    state.still_count = evaluation.still_count;
    state.last_fix = Some(CompactFix {
        latitude: lat,
        longitude: lon,
        timestamp: at,
        geofence_id: None,
        geofence_name: None,
    });

    evaluation.decision
}

#[test]
fn datagram_chain_parses_normalizes_and_validates() {
    let payload = json!({
        "device_id": "D1",
        "lat": "10.0",
        "lon": -74.0,
        "alt": 35.5,
        "acc": 4.2,
        "time": 1741593600,
        "accel": {
            "ts_start": 1741593595,
            "ts_end": 1741593600,
            "rms": {"x": 0.4, "y": 0.2, "z": 0.9, "mag": 1.02},
            "max": {"x": 1.1, "y": 0.7, "z": 1.9, "mag": 2.3},
            "peaks_count": 2,
            "sample_count": 250,
            "flags": 0
        }
    });

    let raw = parse_datagram(payload.to_string().as_bytes(), sender()).unwrap();
    let gps = normalize_gps_payload(&raw).unwrap();

    assert_eq!(gps.device_id, "D1");
    assert_eq!(gps.latitude, 10.0);
    assert_eq!(gps.longitude, -74.0);
    assert_eq!(gps.timestamp, Utc.timestamp_opt(1741593600, 0).unwrap());
    validate_gps(&gps).unwrap();

    let accel = extract_accel_window(&raw, &gps.device_id, gps.timestamp).unwrap();
    validate_accel(&accel).unwrap();
    assert_eq!(accel.sample_count, 250);
    assert_eq!(accel.ts_end, gps.timestamp);
}

#[test]
fn malformed_firmware_payload_still_ingestible() {
    // Log prefix plus single quotes: two fallbacks deep
    let datagram = b"boot: {'DeviceID': 'D1', 'Latitude': 4.6, 'Longitude': -74.1, 'Timestamp': 1741593600}";
    let raw = parse_datagram(datagram, sender()).unwrap();
    let gps = normalize_gps_payload(&raw).unwrap();
    assert_eq!(gps.device_id, "D1");
    validate_gps(&gps).unwrap();
}

#[test]
fn fresh_device_starts_movement_trip() {
    let mut state = DeviceState::default();
    let decision = step(&mut state, 10.0, -74.0, t0());

    assert_eq!(decision, TripDecision::CreateMovementTrip);
    let trip = state.active_trip.as_ref().unwrap();
    assert_eq!(trip.trip_type, TripType::Movement);
    assert!(trip.trip_id.starts_with("TRIP_"));
    assert_eq!(state.still_count, 0);
}

#[test]
fn spatial_jump_closes_and_restarts() {
    let mut state = DeviceState::default();
    step(&mut state, 10.0, -74.0, t0());
    let first_trip = state.active_trip.clone().unwrap();

    // 5 km away ten seconds later: tracker was off or the vehicle was towed
    let decision = step(
        &mut state,
        10.0,
        -74.0 + degrees_for_meters(5000.0),
        t0() + Duration::seconds(10),
    );

    assert_eq!(decision, TripDecision::CloseAndCreate);
    let second_trip = state.active_trip.unwrap();
    assert_ne!(second_trip.trip_id, first_trip.trip_id);
    assert_eq!(second_trip.trip_type, TripType::Movement);
}

#[test]
fn parking_declared_after_240_still_fixes() {
    let mut state = DeviceState::default();
    step(&mut state, 10.0, -74.0, t0());

    // 239 still fixes accumulate evidence without a transition
    for i in 1..240u32 {
        let decision = step(
            &mut state,
            10.0,
            -74.0 + degrees_for_meters(5.0) * (i % 2) as f64,
            t0() + Duration::seconds(5 * i as i64),
        );
        assert_eq!(decision, TripDecision::AssociateExisting, "fix #{}", i + 1);
        assert_eq!(state.still_count, i);
    }

    // Fix #241 is the 240th still fix: parking triggers on it
    let decision = step(&mut state, 10.0, -74.0, t0() + Duration::seconds(1200));
    assert_eq!(decision, TripDecision::CreateParkingTrip);
    let trip = state.active_trip.clone().unwrap();
    assert_eq!(trip.trip_type, TripType::Parking);
    assert!(trip.trip_id.starts_with("PARKING_"));
    assert_eq!(state.still_count, 0);

    // Movement afterwards closes the parking session and resets evidence
    let decision = step(
        &mut state,
        10.0,
        -74.0 + degrees_for_meters(200.0),
        t0() + Duration::seconds(1205),
    );
    assert_eq!(decision, TripDecision::CloseParking);
    assert_eq!(state.still_count, 0);
    assert_eq!(state.active_trip.unwrap().trip_type, TripType::Movement);
}

#[test]
fn duplicate_fix_decision_is_stable() {
    // A resent datagram produces a still fix with zero delta; it never
    // creates or closes trips
    let mut state = DeviceState::default();
    step(&mut state, 10.0, -74.0, t0());
    let trip_before = state.active_trip.clone();

    let evaluation = evaluate(&state, 10.0, -74.0, &TripParams::default());
    assert_eq!(evaluation.decision, TripDecision::AssociateExisting);
    assert_eq!(state.active_trip, trip_before);
}

#[test]
fn restart_restores_counting_from_store_state() {
    // After a restart the tracker rebuilds state from the active trip and
    // the last persisted fix; still evidence keeps accumulating
    let mut state = DeviceState::new(
        Some(CompactFix {
            latitude: 10.0,
            longitude: -74.0,
            timestamp: t0(),
            geofence_id: None,
            geofence_name: None,
        }),
        Some(ActiveTrip {
            trip_id: "TRIP_20250310_D1_001".to_string(),
            trip_type: TripType::Movement,
            start_time: t0(),
        }),
    );

    let decision = step(&mut state, 10.0, -74.0, t0() + Duration::seconds(5));
    assert_eq!(decision, TripDecision::AssociateExisting);
    assert_eq!(state.still_count, 1);
}
