//! Per-device tracking state.
//!
//! The database remains the source of truth; this state is a cache that is
//! rebuilt from `trips` and `gps_data` on startup (or lazily on the first
//! datagram after one) and mutated only after a successful persist.

use chrono::{DateTime, Utc};

use crate::fixes::GpsFix;
use crate::trips::{Trip, TripType};

/// The slice of the previous fix the detectors need
#[derive(Debug, Clone, PartialEq)]
pub struct CompactFix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub geofence_id: Option<String>,
    pub geofence_name: Option<String>,
}

impl CompactFix {
    pub fn from_fix(fix: &GpsFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp: fix.timestamp,
            geofence_id: fix.current_geofence_id.clone(),
            geofence_name: fix.current_geofence_name.clone(),
        }
    }
}

/// Descriptor of the device's currently active trip
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTrip {
    pub trip_id: String,
    pub trip_type: TripType,
    pub start_time: DateTime<Utc>,
}

impl ActiveTrip {
    pub fn from_trip(trip: &Trip) -> Self {
        Self {
            trip_id: trip.trip_id.clone(),
            trip_type: trip.trip_type,
            start_time: trip.start_time,
        }
    }
}

/// Everything the trip detector remembers about one device
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Consecutive fixes below the movement threshold
    pub still_count: u32,
    pub active_trip: Option<ActiveTrip>,
    pub last_fix: Option<CompactFix>,
}

impl DeviceState {
    pub fn new(last_fix: Option<CompactFix>, active_trip: Option<ActiveTrip>) -> Self {
        Self {
            still_count: 0,
            active_trip,
            last_fix,
        }
    }
}
