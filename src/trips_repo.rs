use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

use crate::schema::trips;
use crate::trips::{NewTrip, Trip, TripStatus};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Trip lifecycle queries.
///
/// Creation and close run on a caller-provided connection so the tracker can
/// keep close-then-create inside one transaction; plain lookups draw from
/// the pool.
#[derive(Clone)]
pub struct TripsRepository {
    pool: PgPool,
}

impl TripsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))
    }

    /// The single active trip for a device, if any.
    /// A partial unique index enforces at most one.
    pub fn active_trip_for_device(&self, device_id: &str) -> Result<Option<Trip>> {
        let mut conn = self.get_connection()?;
        let trip = trips::table
            .filter(trips::device_id.eq(device_id))
            .filter(trips::status.eq(TripStatus::Active))
            .first::<Trip>(&mut conn)
            .optional()?;
        Ok(trip)
    }

    /// All active trips, for state restore at startup
    pub fn all_active_trips(&self) -> Result<Vec<Trip>> {
        let mut conn = self.get_connection()?;
        let active = trips::table
            .filter(trips::status.eq(TripStatus::Active))
            .order(trips::start_time.asc())
            .load::<Trip>(&mut conn)?;
        Ok(active)
    }

    pub fn get_trip(&self, trip_id: &str) -> Result<Option<Trip>> {
        let mut conn = self.get_connection()?;
        let trip = trips::table
            .filter(trips::trip_id.eq(trip_id))
            .first::<Trip>(&mut conn)
            .optional()?;
        Ok(trip)
    }

    /// Next per-day sequence number for ids under `prefix`
    /// (e.g. `TRIP_20250101_D1_`)
    pub fn next_sequence_on(conn: &mut PgConnection, prefix: &str) -> QueryResult<u32> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let existing: i64 = trips::table
            .filter(trips::trip_id.like(pattern))
            .count()
            .get_result(conn)?;
        Ok(existing as u32 + 1)
    }

    pub fn create_on(conn: &mut PgConnection, new_trip: &NewTrip) -> QueryResult<Trip> {
        diesel::insert_into(trips::table)
            .values(new_trip)
            .get_result::<Trip>(conn)
    }

    /// Close a trip, writing its final metrics
    pub fn close_on(
        conn: &mut PgConnection,
        trip_id: &str,
        end_time: DateTime<Utc>,
        distance: f64,
        duration: f64,
        avg_speed: f64,
    ) -> QueryResult<usize> {
        diesel::update(trips::table.filter(trips::trip_id.eq(trip_id)))
            .set((
                trips::status.eq(TripStatus::Closed),
                trips::end_time.eq(end_time),
                trips::distance.eq(distance),
                trips::duration.eq(duration),
                trips::avg_speed.eq(avg_speed),
                trips::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
    }

    /// Bump `point_count` for the trip a fix was just associated with
    pub fn increment_point_count_on(
        conn: &mut PgConnection,
        trip_id: &str,
    ) -> QueryResult<usize> {
        diesel::update(trips::table.filter(trips::trip_id.eq(trip_id)))
            .set(trips::point_count.eq(trips::point_count + 1))
            .execute(conn)
    }
}
