//! Geofence transition classification.
//!
//! Given the containing polygon (if any) and the previous fix's geofence,
//! decides the event for the current fix and whether an artificial exit row
//! must be synthesized to keep entry/exit events paired.

use chrono::Duration;
use tracing::warn;

use crate::fixes::{GeofenceEventType, NewGpsFix};
use crate::geofence_repo::{GeofenceHit, GeofenceRepository};
use crate::normalizer::NormalizedGps;

/// Geofence fields for the current fix plus any synthesized exit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeofenceResolution {
    pub geofence_id: Option<String>,
    pub geofence_name: Option<String>,
    pub event: Option<GeofenceEventType>,
    /// Set when this fix enters a zone while the previous fix was inside a
    /// *different* one: the zone being left, for the paired exit row
    pub handoff_exit_from: Option<GeofenceHit>,
}

/// Decision matrix over (current containment, previous geofence).
/// Pure; the spatial lookup happens in [`resolve`].
pub fn classify_transition(
    current: Option<GeofenceHit>,
    previous: Option<&GeofenceHit>,
) -> GeofenceResolution {
    match (current, previous) {
        (Some(hit), Some(prev)) if hit.id == prev.id => GeofenceResolution {
            geofence_id: Some(hit.id),
            geofence_name: Some(hit.name),
            event: Some(GeofenceEventType::Inside),
            handoff_exit_from: None,
        },
        (Some(hit), Some(prev)) => GeofenceResolution {
            geofence_id: Some(hit.id),
            geofence_name: Some(hit.name),
            event: Some(GeofenceEventType::Entry),
            handoff_exit_from: Some(prev.clone()),
        },
        (Some(hit), None) => GeofenceResolution {
            geofence_id: Some(hit.id),
            geofence_name: Some(hit.name),
            event: Some(GeofenceEventType::Entry),
            handoff_exit_from: None,
        },
        (None, Some(_)) => GeofenceResolution {
            geofence_id: None,
            geofence_name: None,
            event: Some(GeofenceEventType::Exit),
            handoff_exit_from: None,
        },
        (None, None) => GeofenceResolution::default(),
    }
}

/// Resolve the geofence state for a fix.
///
/// Degrades safely: a failing spatial query yields null geofence fields and
/// the fix proceeds.
pub fn resolve(
    repo: &GeofenceRepository,
    previous: Option<&GeofenceHit>,
    gps: &NormalizedGps,
) -> GeofenceResolution {
    let current = match repo.find_containing_geofence(gps.latitude, gps.longitude) {
        Ok(current) => current,
        Err(e) => {
            warn!(
                "Geofence lookup failed for {} at ({}, {}): {}",
                gps.device_id, gps.latitude, gps.longitude, e
            );
            metrics::counter!("geofence.lookup_errors").increment(1);
            return GeofenceResolution::default();
        }
    };

    classify_transition(current, previous)
}

/// Build the artificial exit row pairing a zone-to-zone hand-off.
///
/// Same coordinates as the entry fix, timestamped one microsecond earlier so
/// it sorts strictly before it, carrying the geofence being left. Never
/// associated with a trip.
pub fn build_artificial_exit(gps: &NormalizedGps, left: &GeofenceHit) -> NewGpsFix {
    NewGpsFix {
        device_id: gps.device_id.clone(),
        latitude: gps.latitude,
        longitude: gps.longitude,
        altitude: gps.altitude,
        accuracy: gps.accuracy,
        timestamp: gps.timestamp - Duration::microseconds(1),
        trip_id: None,
        current_geofence_id: Some(left.id.clone()),
        current_geofence_name: Some(left.name.clone()),
        geofence_event_type: Some(GeofenceEventType::Exit),
    }
}
