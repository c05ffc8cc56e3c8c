//! WebSocket observer registries.
//!
//! One registry per bus. Each observer is a flume sender feeding that
//! connection's writer task, so a broadcast never awaits socket I/O: frames
//! queue in the channel and the writer drains them on the event loop.
//!
//! An observer is registered before the handshake acknowledgement goes out;
//! broadcasts racing the handshake land in the channel and are delivered
//! once the writer starts.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    /// Keep-alive probe, when the registry has a keep-alive policy
    Ping,
}

#[derive(Clone)]
struct Observer {
    id: u64,
    sender: flume::Sender<OutboundFrame>,
}

/// Set of connected observers for one stream
pub struct ObserverRegistry {
    name: &'static str,
    clients: Mutex<Vec<Observer>>,
    keepalive: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ObserverRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            clients: Mutex::new(Vec::new()),
            keepalive: None,
        }
    }

    /// Same registry, but connections run a periodic ping loop
    pub fn with_keepalive(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            clients: Mutex::new(Vec::new()),
            keepalive: Some(interval),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Interval for the per-connection keep-alive loop; `None` disables it
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive
    }

    /// Add an observer and return its id. Call before acknowledging the
    /// handshake so an immediate broadcast cannot slip past the new client.
    pub fn register(&self, sender: flume::Sender<OutboundFrame>) -> u64 {
        let id = NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut clients = lock(&self.clients);
            clients.push(Observer { id, sender });
            clients.len()
        };
        info!("[{}] Observer {} registered. Total: {}", self.name, id, count);
        metrics::gauge!("ws.observers", "registry" => self.name).set(count as f64);
        id
    }

    /// Remove an observer. Idempotent: removing twice, or removing an id
    /// that was never registered, is a no-op.
    pub fn unregister(&self, id: u64) {
        let removed_count = {
            let mut clients = lock(&self.clients);
            let before = clients.len();
            clients.retain(|observer| observer.id != id);
            if clients.len() != before {
                Some(clients.len())
            } else {
                None
            }
        };
        if let Some(count) = removed_count {
            info!(
                "[{}] Observer {} unregistered. Total: {}",
                self.name, id, count
            );
            metrics::gauge!("ws.observers", "registry" => self.name).set(count as f64);
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    /// Send a text frame to every observer. Iterates a snapshot so
    /// concurrent removals are safe; observers whose channel is gone are
    /// unregistered, the rest are unaffected. Returns the delivery count.
    pub fn broadcast(&self, message: &str) -> usize {
        let snapshot: Vec<Observer> = lock(&self.clients).clone();

        let mut delivered = 0;
        let mut dead: Vec<u64> = Vec::new();
        for observer in &snapshot {
            match observer
                .sender
                .send(OutboundFrame::Text(message.to_string()))
            {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(observer.id),
            }
        }

        for id in dead {
            debug!("[{}] Dropping dead observer {}", self.name, id);
            self.unregister(id);
        }

        delivered
    }

    /// Serialize and broadcast a JSON payload
    pub fn broadcast_json(&self, payload: &Value) -> usize {
        self.broadcast(&payload.to_string())
    }
}
