use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::normalizer::AccelInput;

/// A 5-second accelerometer statistics window accompanying a GPS fix.
///
/// Keyed by (device_id, timestamp) so it pairs with exactly one row in
/// `gps_data`. RMS values capture sustained vibration, max values capture
/// peak impacts, both in g.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::accelerometer_data)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AccelWindow {
    pub id: i64,
    pub device_id: String,
    /// Timestamp of the GPS fix this window belongs to
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
    /// Samples above the impact threshold within the window
    pub peaks_count: i32,
    pub sample_count: i32,
    /// Bitmap of sensor conditions; 0 = clean window
    pub flags: i16,
}

/// Insertable form of [`AccelWindow`]
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::accelerometer_data)]
pub struct NewAccelWindow {
    pub device_id: String,
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

impl From<AccelInput> for NewAccelWindow {
    fn from(input: AccelInput) -> Self {
        Self {
            device_id: input.device_id,
            timestamp: input.timestamp,
            ts_start: input.ts_start,
            ts_end: input.ts_end,
            rms_x: input.rms_x,
            rms_y: input.rms_y,
            rms_z: input.rms_z,
            rms_mag: input.rms_mag,
            max_x: input.max_x,
            max_y: input.max_y,
            max_z: input.max_z,
            max_mag: input.max_mag,
            peaks_count: input.peaks_count,
            sample_count: input.sample_count,
            flags: input.flags,
        }
    }
}
