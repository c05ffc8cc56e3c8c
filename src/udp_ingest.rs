//! UDP ingestion supervisor.
//!
//! OS worker threads share the socket and run the whole per-datagram
//! pipeline with blocking diesel sessions: parse, normalize, validate,
//! track, persist, then hand the public record to the gps bus. A worker
//! never dies on a bad datagram, and never touches WebSocket I/O.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::accel_windows::NewAccelWindow;
use crate::broadcast::Buses;
use crate::device_repo::DeviceRepository;
use crate::fixes_repo::PgPool;
use crate::normalizer;
use crate::packet_parser;
use crate::trip_tracker::TripTracker;
use crate::validator;

/// Max UDP payload we accept; datagrams are far smaller in practice
const RECV_BUFFER_SIZE: usize = 65_535;

/// Blocking reads wake at this cadence to observe the shutdown flag
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

fn count_drop(reason: &'static str) {
    metrics::counter!("udp.datagrams_dropped_total", "reason" => reason).increment(1);
}

/// Per-datagram orchestration, shared by all worker threads
pub struct IngestPipeline {
    device_repo: DeviceRepository,
    tracker: Arc<TripTracker>,
    buses: Buses,
}

impl IngestPipeline {
    pub fn new(pool: PgPool, tracker: Arc<TripTracker>, buses: Buses) -> Self {
        Self {
            device_repo: DeviceRepository::new(pool),
            tracker,
            buses,
        }
    }

    /// Process one datagram end to end. Every failure mode drops the
    /// datagram and returns; nothing propagates to the worker loop.
    pub fn process_datagram(&self, data: &[u8], sender: SocketAddr) {
        metrics::counter!("udp.datagrams_received_total").increment(1);
        let started = Instant::now();

        let raw = match packet_parser::parse_datagram(data, sender) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{}", e);
                count_drop("parse");
                return;
            }
        };

        let gps = match normalizer::normalize_gps_payload(&raw) {
            Ok(gps) => gps,
            Err(e) => {
                warn!("Rejected datagram from {}: {}", sender, e);
                count_drop("normalize");
                return;
            }
        };

        match validator::validate_device(&self.device_repo, &self.buses.log, &gps.device_id, sender)
        {
            Ok(Some(_device)) => {}
            Ok(None) => {
                count_drop("device");
                return;
            }
            Err(e) => {
                error!("Device lookup failed for '{}': {}", gps.device_id, e);
                count_drop("db");
                return;
            }
        }

        if let Err(e) = validator::validate_gps(&gps) {
            warn!("Invalid GPS record from {} ({}): {}", gps.device_id, sender, e);
            count_drop("schema");
            return;
        }

        // Accel is best-effort: a broken window is discarded, the fix is not
        let accel: Option<NewAccelWindow> =
            normalizer::extract_accel_window(&raw, &gps.device_id, gps.timestamp).and_then(
                |window| match validator::validate_accel(&window) {
                    Ok(()) => Some(window.into()),
                    Err(e) => {
                        self.buses.log.warning(format!(
                            "[VALIDATOR] Accel validation error for {}, GPS will still be inserted: {}",
                            gps.device_id, e
                        ));
                        warn!("Accel validation failed for {}: {}", gps.device_id, e);
                        None
                    }
                },
            );

        match self.tracker.process_fix(&gps, accel, &self.buses) {
            Ok(Some(fix)) => {
                if let Ok(payload) = serde_json::to_value(fix.to_public()) {
                    self.buses.gps.add(payload);
                }
            }
            Ok(None) => {
                debug!("Duplicate datagram from {} discarded", gps.device_id);
            }
            Err(e) => {
                error!(
                    "Failed to process fix for '{}', session rolled back: {}",
                    gps.device_id, e
                );
                count_drop("process");
            }
        }

        metrics::histogram!("udp.datagram_processing_ms")
            .record(started.elapsed().as_micros() as f64 / 1000.0);
    }
}

/// Owns the UDP socket and the worker pool
pub struct UdpIngestServer {
    socket: UdpSocket,
    workers: usize,
    pipeline: Arc<IngestPipeline>,
    shutdown: Arc<AtomicBool>,
}

impl UdpIngestServer {
    pub fn bind(port: u16, workers: usize, pipeline: Arc<IngestPipeline>) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .with_context(|| format!("Failed to bind UDP socket on port {}", port))?;
        socket
            .set_read_timeout(Some(SHUTDOWN_POLL))
            .context("Failed to set UDP read timeout")?;

        Ok(Self {
            socket,
            workers,
            pipeline,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed by every worker; set it, then join the handles
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Spawn the worker threads and return their join handles
    pub fn start(self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.workers);

        for worker_index in 0..self.workers {
            let socket = self
                .socket
                .try_clone()
                .context("Failed to clone UDP socket for worker")?;
            let pipeline = self.pipeline.clone();
            let shutdown = self.shutdown.clone();

            let handle = std::thread::Builder::new()
                .name(format!("udp-worker-{}", worker_index))
                .spawn(move || {
                    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                    info!("UDP worker {} started", worker_index);

                    while !shutdown.load(Ordering::SeqCst) {
                        match socket.recv_from(&mut buffer) {
                            Ok((len, sender)) => {
                                pipeline.process_datagram(&buffer[..len], sender);
                            }
                            Err(e)
                                if e.kind() == ErrorKind::WouldBlock
                                    || e.kind() == ErrorKind::TimedOut =>
                            {
                                // Timeout tick; loop around to check shutdown
                            }
                            Err(e) => {
                                error!("UDP worker {} receive error: {}", worker_index, e);
                                std::thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }

                    info!("UDP worker {} stopped", worker_index);
                })
                .context("Failed to spawn UDP worker thread")?;

            handles.push(handle);
        }

        Ok(handles)
    }
}
