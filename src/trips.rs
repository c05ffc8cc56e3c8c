use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Trip classification: the device is either going somewhere or sitting still
/// long enough to call it a parking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[serde(rename_all = "lowercase")]
#[db_enum(existing_type_path = "crate::schema::sql_types::TripType")]
pub enum TripType {
    Movement,
    Parking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[serde(rename_all = "lowercase")]
#[db_enum(existing_type_path = "crate::schema::sql_types::TripStatus")]
pub enum TripStatus {
    Active,
    Closed,
}

/// A labelled segment of a device's fix stream.
///
/// Metrics (`distance`, `duration`, `avg_speed`) are written once at close
/// time; `point_count` is maintained incrementally by the persistence layer.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::trips)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Trip {
    /// Human-decodable id: `TRIP_YYYYMMDD_<device>_NNN` or `PARKING_...`
    pub trip_id: String,
    pub device_id: String,
    pub trip_type: TripType,
    pub status: TripStatus,
    pub start_time: DateTime<Utc>,
    /// NULL while the trip is active
    pub end_time: Option<DateTime<Utc>>,
    pub start_lat: f64,
    pub start_lon: f64,
    /// Meters, cumulative along the trip's fixes
    pub distance: f64,
    /// Seconds between start and end
    pub duration: f64,
    /// km/h; 0 when duration is 0
    pub avg_speed: Option<f64>,
    pub point_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::trips)]
pub struct NewTrip {
    pub trip_id: String,
    pub device_id: String,
    pub trip_type: TripType,
    pub status: TripStatus,
    pub start_time: DateTime<Utc>,
    pub start_lat: f64,
    pub start_lon: f64,
}

impl TripType {
    /// Prefix used in the trip id
    pub fn id_prefix(&self) -> &'static str {
        match self {
            TripType::Movement => "TRIP",
            TripType::Parking => "PARKING",
        }
    }
}

/// `TRIP_20250101_ESP32-001_`: everything but the per-day sequence.
/// The sequence query counts ids under this prefix.
pub fn trip_id_prefix(trip_type: TripType, start: DateTime<Utc>, device_id: &str) -> String {
    format!(
        "{}_{}_{}_",
        trip_type.id_prefix(),
        start.format("%Y%m%d"),
        device_id
    )
}

/// Full trip id with the zero-padded per-day sequence
pub fn format_trip_id(
    trip_type: TripType,
    start: DateTime<Utc>,
    device_id: &str,
    sequence: u32,
) -> String {
    format!(
        "{}{:03}",
        trip_id_prefix(trip_type, start, device_id),
        sequence
    )
}
