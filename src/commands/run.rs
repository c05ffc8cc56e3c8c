use anyhow::{Context, Result};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

use fleetrack::broadcast::{self, Buses};
use fleetrack::config::Settings;
use fleetrack::fixes_repo::FixesRepository;
use fleetrack::geofence_repo::GeofenceRepository;
use fleetrack::request_router::RequestRouter;
use fleetrack::trip_tracker::TripTracker;
use fleetrack::udp_ingest::{IngestPipeline, UdpIngestServer};
use fleetrack::web::{self, AppState, Registries};

pub(crate) const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const DB_POOL_SIZE: u32 = 10;

/// Run the full service: UDP ingestion workers, broadcast dispatchers, the
/// request router and the WebSocket API, wired together here and torn down
/// on ctrl-c.
pub async fn handle_run(settings: Settings) -> Result<()> {
    let manager = ConnectionManager::<PgConnection>::new(&settings.database_url);
    let pool = Pool::builder()
        .max_size(DB_POOL_SIZE)
        .build(manager)
        .context("Failed to create database pool")?;
    info!("Database pool ready ({} connections max)", DB_POOL_SIZE);

    {
        let mut conn = pool
            .get()
            .context("Failed to get connection for migrations")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        if !applied.is_empty() {
            info!("Applied {} pending migrations", applied.len());
        }
    }

    // Metrics recorder must exist before the first counter is touched
    if let Some(port) = settings.metrics_port {
        fleetrack::metrics::init_metrics();
        fleetrack::metrics::initialize_ingest_metrics();
        tokio::spawn(fleetrack::metrics::start_metrics_server(port));
    }

    let buses = Buses::new();
    let registries = Registries::new();
    let tracker = Arc::new(TripTracker::new(&pool, settings.trip_params.clone()));

    // Restore per-device state so still-counters and geofence transitions
    // survive a restart
    {
        let tracker = tracker.clone();
        match tokio::task::spawn_blocking(move || tracker.initialize_from_database()).await? {
            Ok(restored) => info!("Trip tracker initialized ({} devices restored)", restored),
            Err(e) => warn!("Failed to initialize trip tracker from database: {}", e),
        }
    }

    {
        let geofence_repo = GeofenceRepository::new(pool.clone());
        match tokio::task::spawn_blocking(move || geofence_repo.count_active()).await? {
            Ok(count) => info!("{} active geofences", count),
            Err(e) => warn!("Failed to count geofences: {}", e),
        }
    }

    if settings.broadcaster_enabled {
        tokio::spawn(broadcast::run_gps_dispatcher(
            buses.gps.clone(),
            registries.gps.clone(),
        ));
        tokio::spawn(broadcast::run_response_dispatcher(
            buses.response.clone(),
            registries.response.clone(),
        ));
        tokio::spawn(broadcast::run_log_dispatcher(
            buses.log.clone(),
            registries.log.clone(),
        ));
        info!("Broadcast dispatchers started");
    } else {
        info!("Broadcaster disabled by configuration");
    }

    if settings.ddns_enabled {
        info!("DDNS flag set; registration is handled by the external updater");
    }

    let mut udp_shutdown = None;
    let mut udp_threads = Vec::new();
    if settings.udp_enabled {
        let pipeline = Arc::new(IngestPipeline::new(
            pool.clone(),
            tracker.clone(),
            buses.clone(),
        ));
        let server = UdpIngestServer::bind(settings.udp_port, settings.udp_workers, pipeline)?;
        udp_shutdown = Some(server.shutdown_handle());
        udp_threads = server.start()?;
        info!(
            "UDP ingestion listening on port {} with {} workers",
            settings.udp_port, settings.udp_workers
        );
    } else {
        info!("UDP ingestion disabled by configuration");
    }

    let router = RequestRouter::new(FixesRepository::new(pool.clone()), buses.clone());
    let state = AppState {
        pool: pool.clone(),
        registries: registries.clone(),
        router,
    };
    let http_cors = web::cors_layer(&settings.allowed_origins_http);
    let ws_cors = web::cors_layer(&settings.allowed_origins_ws);

    let web_task = tokio::spawn(web::start_web_server(
        settings.interface.clone(),
        settings.port,
        state,
        http_cors,
        ws_cors,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = web_task => {
            match result {
                Ok(Ok(())) => warn!("Web server exited"),
                Ok(Err(e)) => error!("Web server failed: {}", e),
                Err(e) => error!("Web server task panicked: {}", e),
            }
        }
    }

    if let Some(flag) = udp_shutdown {
        flag.store(true, Ordering::SeqCst);
    }
    for handle in udp_threads {
        let _ = handle.join();
    }
    info!("Shutdown complete");

    Ok(())
}
