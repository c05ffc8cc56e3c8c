//! fleetrack - fleet GPS telemetry ingestion and trip segmentation
//!
//! Devices send UDP datagrams carrying a GPS fix and an optional
//! accelerometer window. The service authenticates the device, normalizes
//! the payload, resolves geofence transitions, segments the stream into
//! movement and parking trips, persists everything atomically, and fans out
//! live updates to WebSocket observers.

pub mod accel_windows;
pub mod broadcast;
pub mod config;
pub mod device_repo;
pub mod devices;
pub mod fixes;
pub mod fixes_repo;
pub mod geofence_engine;
pub mod geofence_repo;
pub mod log_format;
pub mod metrics;
pub mod normalizer;
pub mod packet_parser;
pub mod persistence;
pub mod request_router;
pub mod schema;
pub mod trip_tracker;
pub mod trips;
pub mod trips_repo;
pub mod udp_ingest;
pub mod validator;
pub mod web;
pub mod ws_registry;

pub use fixes::{GeofenceEventType, GpsFix, PublicGpsRecord};
pub use normalizer::NormalizedGps;
pub use trip_tracker::{TripParams, TripTracker};
