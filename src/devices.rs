use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A registered GPS tracker.
///
/// Only active devices may write telemetry; deactivating a device keeps its
/// history intact while rejecting new datagrams at the validator.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::devices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Device {
    pub device_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last successfully persisted fix; monotonic
    pub last_seen: Option<DateTime<Utc>>,
}
