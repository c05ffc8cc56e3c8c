//! Geofence containment queries.
//!
//! The `geometry` column is a PostGIS `geography(Polygon, 4326)`, so lookups
//! go through raw SQL. Geography columns do not support `ST_Contains`;
//! containment is expressed with `ST_Intersects`, which the GIST index
//! accelerates.

use anyhow::Result;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_query;
use diesel::sql_types::{BigInt, Double, Text};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// The slice of a geofence row the ingestion path cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeofenceHit {
    pub id: String,
    pub name: String,
}

#[derive(QueryableByName)]
struct GeofenceHitRow {
    #[diesel(sql_type = Text)]
    id: String,
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Clone)]
pub struct GeofenceRepository {
    pool: PgPool,
}

impl GeofenceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))
    }

    /// Smallest active polygon containing the point, or `None` when the
    /// point is in open space. Ascending area breaks ties so nested zones
    /// resolve to the most specific one.
    pub fn find_containing_geofence(&self, lat: f64, lon: f64) -> Result<Option<GeofenceHit>> {
        let mut conn = self.get_connection()?;

        let row: Option<GeofenceHitRow> = sql_query(
            r#"
            SELECT id::text AS id, name::text AS name
            FROM geofences
            WHERE is_active
              AND ST_Intersects(
                  geometry,
                  ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography
              )
            ORDER BY ST_Area(geometry) ASC
            LIMIT 1
            "#,
        )
        .bind::<Double, _>(lon)
        .bind::<Double, _>(lat)
        .get_result(&mut conn)
        .optional()?;

        Ok(row.map(|r| GeofenceHit {
            id: r.id,
            name: r.name,
        }))
    }

    /// Number of active geofences, reported at startup
    pub fn count_active(&self) -> Result<i64> {
        let mut conn = self.get_connection()?;
        let row: CountRow =
            sql_query("SELECT COUNT(*) AS count FROM geofences WHERE is_active")
                .get_result(&mut conn)?;
        Ok(row.count)
    }
}
