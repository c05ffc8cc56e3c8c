//! Thread-safe buses between ingestion workers and the event loop.
//!
//! Producers (OS threads) call `add` and never await; a long-lived
//! dispatcher task per bus drains the buffer and fans out to the matching
//! observer registry. Policies differ per bus:
//!
//! - **gps**: bounded FIFO of 50, oldest evicted on overflow (logged);
//!   payloads are discarded, not retained, when nobody is watching.
//! - **response**: keyed by `request_id`, newer payloads overwrite older
//!   ones; unsent responses are kept for retry until an observer connects.
//! - **log**: fire-and-forget; dropped silently without observers.

use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::ws_registry::ObserverRegistry;

pub const GPS_BUS_CAPACITY: usize = 50;

/// Cadence for retrying retained responses while no observer is connected
const RESPONSE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded FIFO of live GPS payloads
pub struct GpsBus {
    pending: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl GpsBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::with_capacity(GPS_BUS_CAPACITY)),
            notify: Notify::new(),
        })
    }

    /// Enqueue a payload, evicting the oldest when full. Callable from any
    /// thread; wakes the dispatcher.
    pub fn add(&self, payload: Value) {
        {
            let mut pending = lock(&self.pending);
            if pending.len() >= GPS_BUS_CAPACITY {
                let evicted = pending.pop_front();
                let device = evicted
                    .as_ref()
                    .and_then(|p| p.get("DeviceID"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                warn!(
                    "GPS bus full ({}), evicting oldest payload from {}",
                    GPS_BUS_CAPACITY, device
                );
                metrics::counter!("bus.gps.evicted_total").increment(1);
            }
            pending.push_back(payload);
        }
        self.notify.notify_one();
    }

    pub fn drain(&self) -> Vec<Value> {
        lock(&self.pending).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Response buffer coalescing by `request_id`
pub struct ResponseBus {
    pending: Mutex<HashMap<String, Value>>,
    notify: Notify,
}

impl ResponseBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a response payload. Payloads without a `request_id` cannot be
    /// correlated and are dropped.
    pub fn add(&self, payload: Value) {
        let Some(request_id) = payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            debug!("Ignoring response payload without request_id");
            return;
        };

        lock(&self.pending).insert(request_id, payload);
        self.notify.notify_one();
    }

    pub fn drain(&self) -> Vec<Value> {
        lock(&self.pending).drain().map(|(_, v)| v).collect()
    }

    /// Put unsent responses back for the next attempt
    pub fn retain(&self, payloads: Vec<Value>) {
        let mut pending = lock(&self.pending);
        for payload in payloads {
            if let Some(request_id) = payload
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string)
            {
                // A fresher response for the same request wins
                pending.entry(request_id).or_insert(payload);
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Fire-and-forget log stream
pub struct LogBus {
    pending: Mutex<Vec<Value>>,
    notify: Notify,
}

impl LogBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn add(&self, payload: Value) {
        lock(&self.pending).push(payload);
        self.notify.notify_one();
    }

    fn push_message(&self, msg_type: &str, message: String) {
        self.add(json!({ "msg_type": msg_type, "message": message }));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.push_message("log", message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push_message("warning", message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push_message("error", message.into());
    }

    pub fn drain(&self) -> Vec<Value> {
        lock(&self.pending).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// The three buses, wired once at startup and shared by reference
#[derive(Clone)]
pub struct Buses {
    pub gps: Arc<GpsBus>,
    pub response: Arc<ResponseBus>,
    pub log: Arc<LogBus>,
}

impl Buses {
    pub fn new() -> Self {
        Self {
            gps: GpsBus::new(),
            response: ResponseBus::new(),
            log: LogBus::new(),
        }
    }
}

impl Default for Buses {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher for the gps bus: drain, broadcast when observers exist,
/// discard otherwise
pub async fn run_gps_dispatcher(bus: Arc<GpsBus>, registry: Arc<ObserverRegistry>) {
    loop {
        bus.notified().await;
        loop {
            let batch = bus.drain();
            if batch.is_empty() {
                break;
            }
            for payload in batch {
                if registry.has_observers() {
                    registry.broadcast_json(&payload);
                    metrics::counter!("bus.gps.delivered_total").increment(1);
                } else {
                    metrics::counter!("bus.gps.discarded_total").increment(1);
                }
            }
        }
    }
}

/// Dispatcher for the response bus: retained payloads are retried until an
/// observer shows up
pub async fn run_response_dispatcher(bus: Arc<ResponseBus>, registry: Arc<ObserverRegistry>) {
    loop {
        bus.notified().await;
        loop {
            let batch = bus.drain();
            if batch.is_empty() {
                break;
            }
            if registry.has_observers() {
                for payload in batch {
                    registry.broadcast_json(&payload);
                    metrics::counter!("bus.response.delivered_total").increment(1);
                }
            } else {
                bus.retain(batch);
                tokio::time::sleep(RESPONSE_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Dispatcher for the log bus: no observers, no delivery, no retention
pub async fn run_log_dispatcher(bus: Arc<LogBus>, registry: Arc<ObserverRegistry>) {
    loop {
        bus.notified().await;
        loop {
            let batch = bus.drain();
            if batch.is_empty() {
                break;
            }
            if registry.has_observers() {
                for payload in batch {
                    registry.broadcast_json(&payload);
                }
            }
            // else: dropped on the floor, by contract
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gps_bus_fifo_order() {
        let bus = GpsBus::new();
        bus.add(json!({"DeviceID": "a"}));
        bus.add(json!({"DeviceID": "b"}));
        let drained = bus.drain();
        assert_eq!(drained[0]["DeviceID"], "a");
        assert_eq!(drained[1]["DeviceID"], "b");
        assert!(bus.is_empty());
    }

    #[test]
    fn test_gps_bus_evicts_oldest_at_capacity() {
        let bus = GpsBus::new();
        for i in 0..GPS_BUS_CAPACITY + 5 {
            bus.add(json!({"DeviceID": format!("d{}", i)}));
        }
        let drained = bus.drain();
        assert_eq!(drained.len(), GPS_BUS_CAPACITY);
        // The first five were evicted; order among survivors is intact
        assert_eq!(drained[0]["DeviceID"], "d5");
        assert_eq!(
            drained[GPS_BUS_CAPACITY - 1]["DeviceID"],
            format!("d{}", GPS_BUS_CAPACITY + 4)
        );
    }

    #[test]
    fn test_response_bus_coalesces_by_request_id() {
        let bus = ResponseBus::new();
        bus.add(json!({"request_id": "r1", "data": 1}));
        bus.add(json!({"request_id": "r2", "data": 2}));
        bus.add(json!({"request_id": "r1", "data": 3}));

        let mut drained = bus.drain();
        drained.sort_by_key(|p| p["request_id"].as_str().unwrap().to_string());
        assert_eq!(drained.len(), 2);
        // Newer payload overwrote the older one for r1
        assert_eq!(drained[0]["data"], 3);
        assert_eq!(drained[1]["data"], 2);
    }

    #[test]
    fn test_response_bus_drops_uncorrelated_payloads() {
        let bus = ResponseBus::new();
        bus.add(json!({"data": "no id"}));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_response_bus_retain_prefers_fresh() {
        let bus = ResponseBus::new();
        let unsent = vec![json!({"request_id": "r1", "data": "stale"})];
        bus.add(json!({"request_id": "r1", "data": "fresh"}));
        bus.retain(unsent);

        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0]["data"], "fresh");
    }

    #[test]
    fn test_log_bus_levels() {
        let bus = LogBus::new();
        bus.log("hello");
        bus.warning("careful");
        bus.error("boom");

        let drained = bus.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0]["msg_type"], "log");
        assert_eq!(drained[1]["msg_type"], "warning");
        assert_eq!(drained[2]["msg_type"], "error");
        assert_eq!(drained[2]["message"], "boom");
    }
}
