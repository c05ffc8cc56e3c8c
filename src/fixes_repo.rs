use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

use crate::fixes::{GpsFix, NewGpsFix};
use crate::schema::gps_data;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Queries over the `gps_data` table.
///
/// Methods here are synchronous: ingestion runs on OS worker threads with
/// blocking diesel sessions. Async callers (the request-channel monitors)
/// hop through `spawn_blocking` with a cloned repository.
#[derive(Clone)]
pub struct FixesRepository {
    pool: PgPool,
}

impl FixesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))
    }

    /// Insert a fix inside an already-open transaction.
    /// Unique-violation handling is the caller's (persistence layer's) job.
    pub fn insert_on(conn: &mut PgConnection, new_fix: &NewGpsFix) -> QueryResult<GpsFix> {
        diesel::insert_into(gps_data::table)
            .values(new_fix)
            .get_result::<GpsFix>(conn)
    }

    /// Most recent fix for a device; the artificial exit row sorts before its
    /// paired entry because its timestamp is strictly earlier.
    pub fn last_fix_for_device(&self, device_id: &str) -> Result<Option<GpsFix>> {
        let mut conn = self.get_connection()?;
        let fix = gps_data::table
            .filter(gps_data::device_id.eq(device_id))
            .order((gps_data::timestamp.desc(), gps_data::id.desc()))
            .first::<GpsFix>(&mut conn)
            .optional()?;
        Ok(fix)
    }

    /// Oldest fix in the store (the request channel's lower bound)
    pub fn oldest_fix(&self) -> Result<Option<GpsFix>> {
        let mut conn = self.get_connection()?;
        let fix = gps_data::table
            .order((gps_data::timestamp.asc(), gps_data::id.asc()))
            .first::<GpsFix>(&mut conn)
            .optional()?;
        Ok(fix)
    }

    /// Newest fix in the store (the request channel's upper bound)
    pub fn newest_fix(&self) -> Result<Option<GpsFix>> {
        let mut conn = self.get_connection()?;
        let fix = gps_data::table
            .order((gps_data::timestamp.desc(), gps_data::id.desc()))
            .first::<GpsFix>(&mut conn)
            .optional()?;
        Ok(fix)
    }

    /// All fixes in a time window, chronological
    pub fn fixes_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GpsFix>> {
        let mut conn = self.get_connection()?;
        let fixes = gps_data::table
            .filter(gps_data::timestamp.ge(start))
            .filter(gps_data::timestamp.le(end))
            .order((gps_data::timestamp.asc(), gps_data::id.asc()))
            .load::<GpsFix>(&mut conn)?;
        Ok(fixes)
    }

    /// Ordered (lat, lon) track of a trip, for close-time distance computation
    pub fn track_for_trip(&self, trip_id: &str) -> Result<Vec<(f64, f64)>> {
        let mut conn = self.get_connection()?;
        let track = gps_data::table
            .filter(gps_data::trip_id.eq(trip_id))
            .order((gps_data::timestamp.asc(), gps_data::id.asc()))
            .select((gps_data::latitude, gps_data::longitude))
            .load::<(f64, f64)>(&mut conn)?;
        Ok(track)
    }

    /// Same as [`Self::track_for_trip`] but reusing an open connection,
    /// for use inside the trip-close transaction
    pub fn track_for_trip_on(
        conn: &mut PgConnection,
        trip_id: &str,
    ) -> QueryResult<Vec<(f64, f64)>> {
        gps_data::table
            .filter(gps_data::trip_id.eq(trip_id))
            .order((gps_data::timestamp.asc(), gps_data::id.asc()))
            .select((gps_data::latitude, gps_data::longitude))
            .load::<(f64, f64)>(conn)
    }
}
