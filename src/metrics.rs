use axum::{Router, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::{info, warn};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once, before any metric is touched.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "udp.datagram_processing_ms".to_string(),
            ),
            &[0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
        )
        .expect("failed to set buckets for udp.datagram_processing_ms")
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let _ = METRICS_HANDLE.set(handle.clone());
    handle
}

/// Pre-register the ingest counters at zero so dashboards see them before
/// the first event arrives
pub fn initialize_ingest_metrics() {
    metrics::counter!("udp.datagrams_received_total").absolute(0);
    metrics::counter!("udp.datagrams_dropped_total").absolute(0);
    metrics::counter!("udp.parser.lossy_decode").absolute(0);
    metrics::counter!("udp.parser.extraction_fallback").absolute(0);
    metrics::counter!("udp.parser.quote_fallback").absolute(0);
    metrics::counter!("udp.validator.unknown_device").absolute(0);
    metrics::counter!("udp.validator.inactive_device").absolute(0);
    metrics::counter!("persistence.fixes_inserted_total").absolute(0);
    metrics::counter!("persistence.fix_duplicates").absolute(0);
    metrics::counter!("persistence.accel_duplicates").absolute(0);
    metrics::counter!("trips.created_total").absolute(0);
    metrics::counter!("trips.closed_total").absolute(0);
    metrics::counter!("trip_tracker.duplicates_discarded").absolute(0);
    metrics::counter!("trip_tracker.fixes_processed_total").absolute(0);
    metrics::counter!("bus.gps.evicted_total").absolute(0);
    metrics::counter!("bus.gps.delivered_total").absolute(0);
    metrics::counter!("bus.gps.discarded_total").absolute(0);
    metrics::counter!("geofence.lookup_errors").absolute(0);
}

async fn metrics_handler() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => {
            warn!("Metrics endpoint hit before recorder initialization");
            String::new()
        }
    }
}

/// Serve `/metrics` for Prometheus scraping
pub async fn start_metrics_server(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    info!("Metrics server listening on port {}", port);
    if let Err(e) = axum::serve(listener, app).await {
        warn!("Metrics server exited: {}", e);
    }
}
