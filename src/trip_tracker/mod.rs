//! Per-device trip segmentation.
//!
//! Concurrency model: a `DashMap` of per-device states, each behind its own
//! mutex, so two datagrams for the same device serialize while different
//! devices proceed in parallel. The store stays authoritative: state is
//! restored from `trips` + `gps_data` on startup, loaded lazily on a miss,
//! and mutated only after a successful persist.

mod detector;
mod device_state;
mod geometry;
mod lifecycle;

pub use detector::{Evaluation, TripDecision, TripParams, evaluate};
pub use device_state::{ActiveTrip, CompactFix, DeviceState};
pub use geometry::{haversine_distance, track_distance};

use anyhow::Result;
use dashmap::DashMap;
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, trace};

use crate::accel_windows::NewAccelWindow;
use crate::broadcast::Buses;
use crate::fixes::{GeofenceEventType, GpsFix, NewGpsFix};
use crate::fixes_repo::FixesRepository;
use crate::geofence_engine;
use crate::geofence_repo::{GeofenceHit, GeofenceRepository};
use crate::normalizer::NormalizedGps;
use crate::persistence;
use crate::trips_repo::TripsRepository;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

type SharedState = Arc<Mutex<Option<DeviceState>>>;

/// Stateful tracker segmenting each device's fix stream into trips and
/// resolving geofence transitions, then handing the assembled row set to the
/// persistence layer.
pub struct TripTracker {
    pool: PgPool,
    fixes_repo: FixesRepository,
    trips_repo: TripsRepository,
    geofence_repo: GeofenceRepository,
    params: TripParams,
    states: DashMap<String, SharedState>,
}

impl TripTracker {
    pub fn new(pool: &PgPool, params: TripParams) -> Self {
        Self {
            pool: pool.clone(),
            fixes_repo: FixesRepository::new(pool.clone()),
            trips_repo: TripsRepository::new(pool.clone()),
            geofence_repo: GeofenceRepository::new(pool.clone()),
            params,
            states: DashMap::new(),
        }
    }

    /// Restore in-memory state for every device with an active trip.
    /// Returns the number of devices restored.
    pub fn initialize_from_database(&self) -> Result<usize> {
        let active_trips = self.trips_repo.all_active_trips()?;
        let mut restored = 0usize;

        for trip in active_trips {
            let last_fix = self.fixes_repo.last_fix_for_device(&trip.device_id)?;
            let state = DeviceState::new(
                last_fix.as_ref().map(CompactFix::from_fix),
                Some(ActiveTrip::from_trip(&trip)),
            );
            self.states.insert(
                trip.device_id.clone(),
                Arc::new(Mutex::new(Some(state))),
            );
            restored += 1;
        }

        info!("Restored tracking state for {} devices", restored);
        metrics::gauge!("trip_tracker.tracked_devices").set(self.states.len() as f64);
        Ok(restored)
    }

    fn load_state(&self, device_id: &str) -> Result<DeviceState> {
        let active_trip = self.trips_repo.active_trip_for_device(device_id)?;
        let last_fix = self.fixes_repo.last_fix_for_device(device_id)?;
        Ok(DeviceState::new(
            last_fix.as_ref().map(CompactFix::from_fix),
            active_trip.as_ref().map(ActiveTrip::from_trip),
        ))
    }

    fn lock_state(shared: &SharedState) -> MutexGuard<'_, Option<DeviceState>> {
        match shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Process one validated fix end to end: geofence resolution, trip
    /// decision and lifecycle writes, then the atomic persistence step.
    ///
    /// Returns the persisted fix, or `None` when it was a duplicate.
    pub fn process_fix(
        &self,
        gps: &NormalizedGps,
        accel: Option<NewAccelWindow>,
        buses: &Buses,
    ) -> Result<Option<GpsFix>> {
        let shared = self
            .states
            .entry(gps.device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        // Everything below holds the per-device lock, including the DB
        // writes, so same-device datagrams serialize.
        let mut guard = Self::lock_state(&shared);
        if guard.is_none() {
            let loaded = self.load_state(&gps.device_id)?;
            metrics::gauge!("trip_tracker.tracked_devices").set(self.states.len() as f64);
            *guard = Some(loaded);
        }
        let state = guard.get_or_insert_with(DeviceState::default);

        // Exact resend of the previous datagram; the DB unique constraint
        // backstops this across restarts
        if state
            .last_fix
            .as_ref()
            .is_some_and(|prev| prev.timestamp == gps.timestamp)
        {
            trace!("Discarding duplicate fix for {}", gps.device_id);
            metrics::counter!("trip_tracker.duplicates_discarded").increment(1);
            return Ok(None);
        }

        let previous_geofence = state.last_fix.as_ref().and_then(|prev| {
            prev.geofence_id.as_ref().map(|id| GeofenceHit {
                id: id.clone(),
                name: prev
                    .geofence_name
                    .clone()
                    .unwrap_or_else(|| "Unknown Zone".to_string()),
            })
        });

        let resolution =
            geofence_engine::resolve(&self.geofence_repo, previous_geofence.as_ref(), gps);

        let evaluation = evaluate(state, gps.latitude, gps.longitude, &self.params);

        let mut conn = self
            .pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))?;

        let outcome = lifecycle::apply_decision(
            &mut conn,
            evaluation.decision,
            state.active_trip.as_ref(),
            gps,
            &buses.log,
        )?;

        let new_fix = NewGpsFix {
            device_id: gps.device_id.clone(),
            latitude: gps.latitude,
            longitude: gps.longitude,
            altitude: gps.altitude,
            accuracy: gps.accuracy,
            timestamp: gps.timestamp,
            trip_id: outcome.trip_id.clone(),
            current_geofence_id: resolution.geofence_id.clone(),
            current_geofence_name: resolution.geofence_name.clone(),
            geofence_event_type: resolution.event,
        };

        let artificial_exit = resolution
            .handoff_exit_from
            .as_ref()
            .map(|left| geofence_engine::build_artificial_exit(gps, left));

        let persisted = persistence::insert_data(
            &mut conn,
            artificial_exit.as_ref(),
            &new_fix,
            accel.as_ref(),
            &buses.log,
        )?;

        // Trip writes committed even when the fix turned out to be a
        // duplicate; the descriptor must follow the store either way
        state.active_trip = outcome.active_trip;

        let Some(fix) = persisted.fix else {
            return Ok(None);
        };

        state.still_count = evaluation.still_count;
        state.last_fix = Some(CompactFix::from_fix(&fix));

        // Transition lines only; `inside` would flood the log stream
        if let Some(left) = &resolution.handoff_exit_from {
            buses
                .log
                .log(format!("[GEOFENCE] {} EXITED {}", gps.device_id, left.name));
        }
        match resolution.event {
            Some(GeofenceEventType::Entry) => {
                buses.log.log(format!(
                    "[GEOFENCE] {} ENTERED {}",
                    gps.device_id,
                    resolution.geofence_name.as_deref().unwrap_or("Unknown")
                ));
            }
            Some(GeofenceEventType::Exit) => {
                let left = previous_geofence
                    .as_ref()
                    .map(|hit| hit.name.as_str())
                    .unwrap_or("Unknown Zone");
                buses
                    .log
                    .log(format!("[GEOFENCE] {} EXITED {}", gps.device_id, left));
            }
            _ => {}
        }

        metrics::counter!("trip_tracker.fixes_processed_total").increment(1);
        Ok(Some(fix))
    }
}
