use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Geofence transition recorded on a fix.
///
/// `Inside` is persisted but never pushed to the log bus (one line per fix
/// inside a zone would drown everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[serde(rename_all = "lowercase")]
#[db_enum(existing_type_path = "crate::schema::sql_types::GeofenceEvent")]
pub enum GeofenceEventType {
    Entry,
    Exit,
    Inside,
}

impl GeofenceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceEventType::Entry => "entry",
            GeofenceEventType::Exit => "exit",
            GeofenceEventType::Inside => "inside",
        }
    }
}

/// A persisted GPS observation from a device.
/// This is the unified domain entity for live broadcasts and database storage.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::gps_data)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GpsFix {
    /// Monotonic row id
    pub id: i64,

    pub device_id: String,

    /// Position
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,

    /// Device-reported UTC instant; unique per device
    pub timestamp: DateTime<Utc>,

    /// Trip this fix belongs to, when the detector associated one
    pub trip_id: Option<String>,

    /// Geofence state at this fix
    pub current_geofence_id: Option<String>,
    pub current_geofence_name: Option<String>,
    pub geofence_event_type: Option<GeofenceEventType>,
}

/// Insertable form of [`GpsFix`] (id is assigned by the database)
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::gps_data)]
pub struct NewGpsFix {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub current_geofence_id: Option<String>,
    pub current_geofence_name: Option<String>,
    pub geofence_event_type: Option<GeofenceEventType>,
}

/// Nested geofence object on the public GPS record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicGeofence {
    pub id: Option<String>,
    pub name: Option<String>,
    pub event: Option<GeofenceEventType>,
}

/// The GPS record as observers see it on the live stream.
///
/// Field casing follows the device wire protocol (`DeviceID`, `Latitude`, ...)
/// so trackers and dashboards share one vocabulary; the timestamp is always
/// rendered as `YYYY-MM-DDTHH:MM:SSZ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicGpsRecord {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Altitude")]
    pub altitude: f64,
    #[serde(rename = "Accuracy")]
    pub accuracy: f64,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    pub geofence: Option<PublicGeofence>,
}

/// Render a UTC instant in the public wire format
pub fn format_public_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl GpsFix {
    /// Serialize this fix for the live GPS stream.
    ///
    /// `exit` events always carry the geofence that was left, even though
    /// the fix itself is outside every zone.
    pub fn to_public(&self) -> PublicGpsRecord {
        let geofence = if self.current_geofence_id.is_some()
            || self.geofence_event_type == Some(GeofenceEventType::Exit)
        {
            Some(PublicGeofence {
                id: self.current_geofence_id.clone(),
                name: self.current_geofence_name.clone(),
                event: self.geofence_event_type,
            })
        } else {
            None
        };

        PublicGpsRecord {
            device_id: self.device_id.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            accuracy: self.accuracy,
            timestamp: format_public_timestamp(self.timestamp),
            geofence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_fix() -> GpsFix {
        GpsFix {
            id: 42,
            device_id: "TRUCK-001".to_string(),
            latitude: 10.9878,
            longitude: -74.7889,
            altitude: 12.5,
            accuracy: 8.0,
            timestamp: Utc.with_ymd_and_hms(2025, 10, 22, 9, 34, 28).unwrap(),
            trip_id: None,
            current_geofence_id: None,
            current_geofence_name: None,
            geofence_event_type: None,
        }
    }

    #[test]
    fn test_public_record_outside_geofences() {
        let record = create_test_fix().to_public();
        assert_eq!(record.device_id, "TRUCK-001");
        assert_eq!(record.timestamp, "2025-10-22T09:34:28Z");
        assert!(record.geofence.is_none());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["DeviceID"], "TRUCK-001");
        assert_eq!(json["Timestamp"], "2025-10-22T09:34:28Z");
        assert!(json["geofence"].is_null());
    }

    #[test]
    fn test_public_record_inside_geofence() {
        let mut fix = create_test_fix();
        fix.current_geofence_id = Some("warehouse-001".to_string());
        fix.current_geofence_name = Some("Main Warehouse".to_string());
        fix.geofence_event_type = Some(GeofenceEventType::Entry);

        let record = fix.to_public();
        let geofence = record.geofence.expect("geofence object expected");
        assert_eq!(geofence.id.as_deref(), Some("warehouse-001"));
        assert_eq!(geofence.name.as_deref(), Some("Main Warehouse"));
        assert_eq!(geofence.event, Some(GeofenceEventType::Entry));
    }

    #[test]
    fn test_exit_event_carries_previous_geofence() {
        // Artificial exit rows still name the geofence the device left
        let mut fix = create_test_fix();
        fix.current_geofence_id = Some("warehouse-001".to_string());
        fix.current_geofence_name = Some("Main Warehouse".to_string());
        fix.geofence_event_type = Some(GeofenceEventType::Exit);

        let record = fix.to_public();
        let geofence = record.geofence.expect("exit must carry geofence");
        assert_eq!(geofence.event, Some(GeofenceEventType::Exit));
        assert_eq!(geofence.id.as_deref(), Some("warehouse-001"));
    }

    #[test]
    fn test_exit_without_geofence_id_still_nested() {
        // A plain exit into open space has null id/name but keeps the object
        let mut fix = create_test_fix();
        fix.geofence_event_type = Some(GeofenceEventType::Exit);

        let record = fix.to_public();
        let geofence = record.geofence.expect("exit must produce object");
        assert!(geofence.id.is_none());
        assert_eq!(geofence.event, Some(GeofenceEventType::Exit));
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        let rendered = format_public_timestamp(instant);
        assert_eq!(rendered, "2025-01-31T23:59:59Z");

        let parsed: DateTime<Utc> = rendered.parse().unwrap();
        assert_eq!(parsed, instant);
    }

    #[test]
    fn test_event_type_serde_casing() {
        assert_eq!(
            serde_json::to_string(&GeofenceEventType::Entry).unwrap(),
            "\"entry\""
        );
        assert_eq!(GeofenceEventType::Exit.as_str(), "exit");
    }
}
