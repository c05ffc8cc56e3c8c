//! The trip decision matrix.
//!
//! Pure function over the device state and the incoming position; executing
//! the resulting decision against the store is `lifecycle`'s job. Parking is
//! declared on accumulated evidence (a run of still fixes) rather than a
//! time threshold, which keeps it robust to dropped datagrams.

use serde::Serialize;

use super::device_state::DeviceState;
use super::geometry::haversine_distance;
use crate::trips::TripType;

/// Trip-detector thresholds; see `Settings` for the environment overrides
#[derive(Debug, Clone)]
pub struct TripParams {
    /// Distance attributed to a discontinuity (tracker off, relocation),
    /// never bridged into one trip. Strictly greater-than.
    pub spatial_jump_m: f64,
    /// Below this distance between consecutive fixes the device is "still"
    pub movement_threshold_m: f64,
    /// Consecutive still fixes before a parking session is declared
    /// (240 at a 5-second cadence is about 20 minutes)
    pub parking_still_count: u32,
}

impl Default for TripParams {
    fn default() -> Self {
        Self {
            spatial_jump_m: 2000.0,
            movement_threshold_m: 50.0,
            parking_still_count: 240,
        }
    }
}

/// What the state machine wants done for one fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripDecision {
    /// First fix for the device (or movement with no active trip)
    CreateMovementTrip,
    /// Spatial jump: close whatever is active, start a fresh movement trip
    CloseAndCreate,
    /// Movement resumed while a parking session is active
    CloseParking,
    /// Fix joins the active trip unchanged
    AssociateExisting,
    /// Still fix with no active trip; evidence keeps accumulating
    IncrementStillCounter,
    /// Still run reached the threshold: close the movement trip, open parking
    CreateParkingTrip,
}

/// Outcome of evaluating one fix: the decision plus the still-counter value
/// the state should carry afterwards
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub decision: TripDecision,
    pub still_count: u32,
    /// Distance from the previous fix, when one existed
    pub delta_m: Option<f64>,
}

/// Run the decision matrix for a fix at (`lat`, `lon`)
pub fn evaluate(state: &DeviceState, lat: f64, lon: f64, params: &TripParams) -> Evaluation {
    let Some(prev) = &state.last_fix else {
        return Evaluation {
            decision: TripDecision::CreateMovementTrip,
            still_count: 0,
            delta_m: None,
        };
    };

    let delta = haversine_distance(prev.latitude, prev.longitude, lat, lon);

    if delta > params.spatial_jump_m {
        return Evaluation {
            decision: TripDecision::CloseAndCreate,
            still_count: 0,
            delta_m: Some(delta),
        };
    }

    if delta > params.movement_threshold_m {
        let decision = match &state.active_trip {
            Some(trip) if trip.trip_type == TripType::Parking => TripDecision::CloseParking,
            Some(_) => TripDecision::AssociateExisting,
            None => TripDecision::CreateMovementTrip,
        };
        return Evaluation {
            decision,
            still_count: 0,
            delta_m: Some(delta),
        };
    }

    // Still fix: one more piece of evidence
    let still_count = state.still_count + 1;
    let decision = match &state.active_trip {
        Some(trip)
            if trip.trip_type == TripType::Movement
                && still_count >= params.parking_still_count =>
        {
            TripDecision::CreateParkingTrip
        }
        Some(_) => TripDecision::AssociateExisting,
        None => TripDecision::IncrementStillCounter,
    };

    Evaluation {
        decision,
        // The counter restarts once parking is declared
        still_count: if decision == TripDecision::CreateParkingTrip {
            0
        } else {
            still_count
        },
        delta_m: Some(delta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip_tracker::device_state::{ActiveTrip, CompactFix};
    use chrono::{TimeZone, Utc};

    fn params() -> TripParams {
        TripParams::default()
    }

    fn state_at(lat: f64, lon: f64) -> DeviceState {
        DeviceState {
            still_count: 0,
            active_trip: Some(ActiveTrip {
                trip_id: "TRIP_20250101_D1_001".to_string(),
                trip_type: TripType::Movement,
                start_time: Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap(),
            }),
            last_fix: Some(CompactFix {
                latitude: lat,
                longitude: lon,
                timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap(),
                geofence_id: None,
                geofence_name: None,
            }),
        }
    }

    /// Offset in degrees of longitude at the equator for a given distance
    fn degrees_for_meters(m: f64) -> f64 {
        m / 111_195.0
    }

    #[test]
    fn test_first_fix_creates_movement_trip() {
        let state = DeviceState::default();
        let eval = evaluate(&state, 10.0, -74.0, &params());
        assert_eq!(eval.decision, TripDecision::CreateMovementTrip);
        assert_eq!(eval.still_count, 0);
        assert!(eval.delta_m.is_none());
    }

    #[test]
    fn test_spatial_jump_closes_and_creates() {
        let state = state_at(0.0, 0.0);
        let eval = evaluate(&state, 0.0, degrees_for_meters(5000.0), &params());
        assert_eq!(eval.decision, TripDecision::CloseAndCreate);
        assert_eq!(eval.still_count, 0);
    }

    #[test]
    fn test_exactly_spatial_jump_does_not_close() {
        // Strict greater-than: a delta of exactly SPATIAL_JUMP_M is movement
        let state = state_at(0.0, 0.0);
        let exactly = evaluate(&state, 0.0, degrees_for_meters(2000.0), &params());
        assert_eq!(exactly.decision, TripDecision::AssociateExisting);

        let just_over = evaluate(&state, 0.0, degrees_for_meters(2000.5), &params());
        assert_eq!(just_over.decision, TripDecision::CloseAndCreate);
    }

    #[test]
    fn test_movement_resets_still_counter() {
        let mut state = state_at(0.0, 0.0);
        state.still_count = 120;
        let eval = evaluate(&state, 0.0, degrees_for_meters(100.0), &params());
        assert_eq!(eval.decision, TripDecision::AssociateExisting);
        assert_eq!(eval.still_count, 0);
    }

    #[test]
    fn test_movement_closes_parking_session() {
        let mut state = state_at(0.0, 0.0);
        state.active_trip.as_mut().unwrap().trip_type = TripType::Parking;
        let eval = evaluate(&state, 0.0, degrees_for_meters(100.0), &params());
        assert_eq!(eval.decision, TripDecision::CloseParking);
        assert_eq!(eval.still_count, 0);
    }

    #[test]
    fn test_movement_without_active_trip_starts_one() {
        let mut state = state_at(0.0, 0.0);
        state.active_trip = None;
        let eval = evaluate(&state, 0.0, degrees_for_meters(100.0), &params());
        assert_eq!(eval.decision, TripDecision::CreateMovementTrip);
    }

    #[test]
    fn test_still_fix_increments_counter() {
        let state = state_at(0.0, 0.0);
        let eval = evaluate(&state, 0.0, degrees_for_meters(10.0), &params());
        assert_eq!(eval.decision, TripDecision::AssociateExisting);
        assert_eq!(eval.still_count, 1);
    }

    #[test]
    fn test_parking_declared_exactly_at_threshold() {
        let mut state = state_at(0.0, 0.0);
        state.still_count = params().parking_still_count - 1;
        // This fix is still number 240: parking triggers on it, not later
        let eval = evaluate(&state, 0.0, degrees_for_meters(10.0), &params());
        assert_eq!(eval.decision, TripDecision::CreateParkingTrip);
        assert_eq!(eval.still_count, 0);
    }

    #[test]
    fn test_one_below_threshold_keeps_accumulating() {
        let mut state = state_at(0.0, 0.0);
        state.still_count = params().parking_still_count - 2;
        let eval = evaluate(&state, 0.0, degrees_for_meters(10.0), &params());
        assert_eq!(eval.decision, TripDecision::AssociateExisting);
        assert_eq!(eval.still_count, params().parking_still_count - 1);
    }

    #[test]
    fn test_still_threshold_ignored_while_parked() {
        // A parking trip never rolls over into another parking trip
        let mut state = state_at(0.0, 0.0);
        state.active_trip.as_mut().unwrap().trip_type = TripType::Parking;
        state.still_count = 1000;
        let eval = evaluate(&state, 0.0, degrees_for_meters(1.0), &params());
        assert_eq!(eval.decision, TripDecision::AssociateExisting);
    }

    #[test]
    fn test_still_with_no_trip_accumulates_only() {
        let mut state = state_at(0.0, 0.0);
        state.active_trip = None;
        state.still_count = 3;
        let eval = evaluate(&state, 0.0, 0.0, &params());
        assert_eq!(eval.decision, TripDecision::IncrementStillCounter);
        assert_eq!(eval.still_count, 4);
    }

    #[test]
    fn test_spatial_jump_beats_parking_threshold() {
        let mut state = state_at(0.0, 0.0);
        state.still_count = 239;
        let eval = evaluate(&state, 0.0, degrees_for_meters(3000.0), &params());
        assert_eq!(eval.decision, TripDecision::CloseAndCreate);
        assert_eq!(eval.still_count, 0);
    }
}
