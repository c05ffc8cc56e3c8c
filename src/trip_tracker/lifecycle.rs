//! Executes trip decisions against the store.
//!
//! Close-then-create runs inside one transaction so the at-most-one-active
//! invariant holds at every commit point; the fix that triggered the
//! transition is persisted afterwards, already carrying the new trip id.

use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::info;

use super::detector::TripDecision;
use super::device_state::ActiveTrip;
use super::geometry::track_distance;
use crate::broadcast::LogBus;
use crate::fixes_repo::FixesRepository;
use crate::normalizer::NormalizedGps;
use crate::trips::{NewTrip, TripStatus, TripType, format_trip_id, trip_id_prefix};
use crate::trips_repo::TripsRepository;

/// Result of executing a decision: the association for the incoming fix and
/// the active-trip descriptor the device state should carry afterwards
#[derive(Debug, Clone)]
pub(crate) struct DecisionOutcome {
    pub trip_id: Option<String>,
    pub active_trip: Option<ActiveTrip>,
}

fn create_trip(
    conn: &mut PgConnection,
    trip_type: TripType,
    gps: &NormalizedGps,
    log_bus: &LogBus,
) -> Result<ActiveTrip> {
    let prefix = trip_id_prefix(trip_type, gps.timestamp, &gps.device_id);
    let sequence = TripsRepository::next_sequence_on(conn, &prefix)?;
    let trip_id = format_trip_id(trip_type, gps.timestamp, &gps.device_id, sequence);

    let trip = TripsRepository::create_on(
        conn,
        &NewTrip {
            trip_id,
            device_id: gps.device_id.clone(),
            trip_type,
            status: TripStatus::Active,
            start_time: gps.timestamp,
            start_lat: gps.latitude,
            start_lon: gps.longitude,
        },
    )?;

    info!("Started {} for device {}", trip.trip_id, gps.device_id);
    metrics::counter!("trips.created_total").increment(1);
    log_bus.log(format!(
        "[TRIP] {} started {}",
        gps.device_id, trip.trip_id
    ));

    Ok(ActiveTrip::from_trip(&trip))
}

/// Close a trip at `end_time`, computing its final metrics from the
/// persisted track
fn close_trip(
    conn: &mut PgConnection,
    active: &ActiveTrip,
    end_time: DateTime<Utc>,
    device_id: &str,
    log_bus: &LogBus,
) -> Result<()> {
    let track = FixesRepository::track_for_trip_on(conn, &active.trip_id)?;
    let distance = track_distance(&track);
    let duration = ((end_time - active.start_time).num_milliseconds() as f64 / 1000.0).max(0.0);
    let avg_speed = if duration > 0.0 {
        distance / duration * 3.6
    } else {
        0.0
    };

    TripsRepository::close_on(conn, &active.trip_id, end_time, distance, duration, avg_speed)?;

    info!(
        "Closed {} for device {} ({:.0} m in {:.0} s)",
        active.trip_id, device_id, distance, duration
    );
    metrics::counter!("trips.closed_total").increment(1);
    log_bus.log(format!("[TRIP] {} closed {}", device_id, active.trip_id));

    Ok(())
}

/// Execute one decision in a single transaction
pub(crate) fn apply_decision(
    conn: &mut PgConnection,
    decision: TripDecision,
    current: Option<&ActiveTrip>,
    gps: &NormalizedGps,
    log_bus: &LogBus,
) -> Result<DecisionOutcome> {
    conn.transaction::<DecisionOutcome, anyhow::Error, _>(|conn| {
        match decision {
            TripDecision::CreateMovementTrip => {
                let trip = create_trip(conn, TripType::Movement, gps, log_bus)?;
                Ok(DecisionOutcome {
                    trip_id: Some(trip.trip_id.clone()),
                    active_trip: Some(trip),
                })
            }
            TripDecision::CloseAndCreate => {
                if let Some(active) = current {
                    close_trip(conn, active, gps.timestamp, &gps.device_id, log_bus)?;
                }
                let trip = create_trip(conn, TripType::Movement, gps, log_bus)?;
                Ok(DecisionOutcome {
                    trip_id: Some(trip.trip_id.clone()),
                    active_trip: Some(trip),
                })
            }
            TripDecision::CloseParking => {
                if let Some(active) = current {
                    close_trip(conn, active, gps.timestamp, &gps.device_id, log_bus)?;
                }
                let trip = create_trip(conn, TripType::Movement, gps, log_bus)?;
                Ok(DecisionOutcome {
                    trip_id: Some(trip.trip_id.clone()),
                    active_trip: Some(trip),
                })
            }
            TripDecision::CreateParkingTrip => {
                if let Some(active) = current {
                    close_trip(conn, active, gps.timestamp, &gps.device_id, log_bus)?;
                }
                let trip = create_trip(conn, TripType::Parking, gps, log_bus)?;
                Ok(DecisionOutcome {
                    trip_id: Some(trip.trip_id.clone()),
                    active_trip: Some(trip),
                })
            }
            TripDecision::AssociateExisting => Ok(DecisionOutcome {
                trip_id: current.map(|t| t.trip_id.clone()),
                active_trip: current.cloned(),
            }),
            TripDecision::IncrementStillCounter => Ok(DecisionOutcome {
                trip_id: None,
                active_trip: current.cloned(),
            }),
        }
    })
}
