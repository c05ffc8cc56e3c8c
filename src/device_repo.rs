use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

use crate::devices::Device;
use crate::schema::devices;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Lookups against the device registry.
/// Registration itself happens through the external CRUD surface; the
/// ingestion path only reads and stamps freshness.
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))
    }

    /// Fetch a device by id; `None` means unregistered
    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let mut conn = self.get_connection()?;
        let device = devices::table
            .filter(devices::device_id.eq(device_id))
            .first::<Device>(&mut conn)
            .optional()?;
        Ok(device)
    }

    /// Stamp `last_seen` inside the persistence transaction.
    /// Guarded to be monotonic: an out-of-order duplicate can never move the
    /// freshness marker backwards.
    pub fn update_last_seen_on(
        conn: &mut PgConnection,
        device_id: &str,
        seen_at: DateTime<Utc>,
    ) -> QueryResult<usize> {
        diesel::update(
            devices::table
                .filter(devices::device_id.eq(device_id))
                .filter(devices::last_seen.is_null().or(devices::last_seen.le(seen_at))),
        )
        .set(devices::last_seen.eq(seen_at))
        .execute(conn)
    }
}
