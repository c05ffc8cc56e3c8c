//! The request-channel grammar and its monitor tasks.
//!
//! Observers send `{action, request_id, params}` on the request WebSocket.
//! Replies travel on the response bus, except upper-bound emissions: the
//! newest fix is a live GPS event and goes out on the gps bus.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::Buses;
use crate::fixes_repo::FixesRepository;

/// Polling cadence of the bound monitors
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Standard envelope for every reply on the response stream
pub fn build_response(
    action: &str,
    request_id: Option<&str>,
    data: Value,
    status: &str,
) -> Value {
    json!({
        "action": action,
        "request_id": request_id,
        "status": status,
        "data": data,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Parse an ISO-8601 instant, treating `Z` and naive forms as UTC
fn parse_iso_instant(value: &str) -> anyhow::Result<DateTime<Utc>> {
    crate::normalizer::normalize_timestamp(&Value::String(value.to_string()))
}

/// Router state shared by the request-channel connections.
///
/// Monitors are single-flight per bound: re-subscription refreshes the
/// correlation id but never spawns a second task, and cancelling a
/// non-running monitor is a no-op.
pub struct RequestRouter {
    fixes_repo: FixesRepository,
    buses: Buses,

    lower_active: AtomicBool,
    lower_task: Mutex<Option<JoinHandle<()>>>,
    lower_request_id: Mutex<Option<String>>,
    lower_last_id: Mutex<Option<i64>>,

    upper_active: AtomicBool,
    upper_task: Mutex<Option<JoinHandle<()>>>,
    upper_last_id: Mutex<Option<i64>>,
}

impl RequestRouter {
    pub fn new(fixes_repo: FixesRepository, buses: Buses) -> Arc<Self> {
        Arc::new(Self {
            fixes_repo,
            buses,
            lower_active: AtomicBool::new(false),
            lower_task: Mutex::new(None),
            lower_request_id: Mutex::new(None),
            lower_last_id: Mutex::new(None),
            upper_active: AtomicBool::new(false),
            upper_task: Mutex::new(None),
            upper_last_id: Mutex::new(None),
        })
    }

    /// Entry point for one inbound request-channel message
    pub async fn handle_message(self: &Arc<Self>, text: &str) {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            debug!("Invalid JSON on request channel: {}", text);
            return;
        };

        let Some(action) = message.get("action").and_then(Value::as_str) else {
            debug!("Request without 'action' field ignored");
            return;
        };
        let action = action.to_string();
        let request_id = message
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = message
            .get("params")
            .cloned()
            .unwrap_or_else(|| json!({}));

        metrics::counter!("request_router.messages", "action" => action.clone()).increment(1);

        match action.as_str() {
            "ping" => {
                self.buses.response.add(build_response(
                    "ping",
                    request_id.as_deref(),
                    json!("pong"),
                    "success",
                ));
            }
            "get_lower_bound" => {
                let subscribe = params
                    .get("subscribe")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if subscribe {
                    self.subscribe_lower(request_id).await;
                } else {
                    self.unsubscribe_lower();
                }
            }
            "get_upper_bound" => {
                let subscribe = params
                    .get("subscribe")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if subscribe {
                    self.subscribe_upper().await;
                } else {
                    self.unsubscribe_upper();
                }
            }
            "get_history" => {
                self.handle_history(request_id, &params).await;
            }
            unknown => {
                self.buses.response.add(build_response(
                    unknown,
                    request_id.as_deref(),
                    json!({ "error": format!("Unknown action '{}'", unknown), "params": params }),
                    "error",
                ));
            }
        }
    }

    async fn subscribe_lower(self: &Arc<Self>, request_id: Option<String>) {
        *lock(&self.lower_request_id) = request_id.clone();
        self.lower_active.store(true, Ordering::SeqCst);

        // Immediate snapshot so the subscriber does not wait a full tick
        let repo = self.fixes_repo.clone();
        match tokio::task::spawn_blocking(move || repo.oldest_fix()).await {
            Ok(Ok(Some(fix))) => {
                *lock(&self.lower_last_id) = Some(fix.id);
                self.buses.response.add(build_response(
                    "get_lower_bound",
                    request_id.as_deref(),
                    serde_json::to_value(fix.to_public()).unwrap_or(Value::Null),
                    "success",
                ));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("lower-bound snapshot query failed: {}", e),
            Err(e) => warn!("lower-bound snapshot task failed: {}", e),
        }

        let mut task = lock(&self.lower_task);
        let running = task.as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            *task = Some(self.spawn_lower_monitor());
            info!("lower-bound monitor subscribed");
        }
    }

    fn unsubscribe_lower(&self) {
        self.lower_active.store(false, Ordering::SeqCst);
        *lock(&self.lower_request_id) = None;
        // The task observes the flag on its next tick and exits
        lock(&self.lower_task).take();
        info!("lower-bound monitor unsubscribed");
    }

    async fn subscribe_upper(self: &Arc<Self>) {
        self.upper_active.store(true, Ordering::SeqCst);

        let repo = self.fixes_repo.clone();
        match tokio::task::spawn_blocking(move || repo.newest_fix()).await {
            Ok(Ok(Some(fix))) => {
                *lock(&self.upper_last_id) = Some(fix.id);
                if let Ok(payload) = serde_json::to_value(fix.to_public()) {
                    self.buses.gps.add(payload);
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("upper-bound snapshot query failed: {}", e),
            Err(e) => warn!("upper-bound snapshot task failed: {}", e),
        }

        let mut task = lock(&self.upper_task);
        let running = task.as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            *task = Some(self.spawn_upper_monitor());
            info!("upper-bound monitor subscribed");
        }
    }

    fn unsubscribe_upper(&self) {
        self.upper_active.store(false, Ordering::SeqCst);
        lock(&self.upper_task).take();
        info!("upper-bound monitor unsubscribed");
    }

    fn spawn_lower_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                if !router.lower_active.load(Ordering::SeqCst) {
                    break;
                }
                let repo = router.fixes_repo.clone();
                match tokio::task::spawn_blocking(move || repo.oldest_fix()).await {
                    Ok(Ok(Some(fix))) => {
                        let changed = *lock(&router.lower_last_id) != Some(fix.id);
                        let request_id = lock(&router.lower_request_id).clone();
                        if changed && request_id.is_some() {
                            *lock(&router.lower_last_id) = Some(fix.id);
                            router.buses.response.add(build_response(
                                "get_lower_bound",
                                request_id.as_deref(),
                                serde_json::to_value(fix.to_public()).unwrap_or(Value::Null),
                                "success",
                            ));
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!("lower-bound monitor query failed: {}", e),
                    Err(e) => warn!("lower-bound monitor task failed: {}", e),
                }
            }
            debug!("lower-bound monitor stopped");
        })
    }

    fn spawn_upper_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                if !router.upper_active.load(Ordering::SeqCst) {
                    break;
                }
                let repo = router.fixes_repo.clone();
                match tokio::task::spawn_blocking(move || repo.newest_fix()).await {
                    Ok(Ok(Some(fix))) => {
                        let changed = *lock(&router.upper_last_id) != Some(fix.id);
                        if changed {
                            *lock(&router.upper_last_id) = Some(fix.id);
                            if let Ok(payload) = serde_json::to_value(fix.to_public()) {
                                router.buses.gps.add(payload);
                            }
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!("upper-bound monitor query failed: {}", e),
                    Err(e) => warn!("upper-bound monitor task failed: {}", e),
                }
            }
            debug!("upper-bound monitor stopped");
        })
    }

    async fn handle_history(self: &Arc<Self>, request_id: Option<String>, params: &Value) {
        let result: anyhow::Result<Value> = async {
            let start = params
                .get("start")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("Missing 'start' or 'end' parameters"))?;
            let end = params
                .get("end")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("Missing 'start' or 'end' parameters"))?;

            let start = parse_iso_instant(start)?;
            let end = parse_iso_instant(end)?;

            let repo = self.fixes_repo.clone();
            let fixes = tokio::task::spawn_blocking(move || repo.fixes_in_range(start, end))
                .await??;

            let records: Vec<Value> = fixes
                .iter()
                .map(|fix| serde_json::to_value(fix.to_public()).unwrap_or(Value::Null))
                .collect();
            Ok(Value::Array(records))
        }
        .await;

        match result {
            Ok(data) => {
                self.buses.response.add(build_response(
                    "get_history",
                    request_id.as_deref(),
                    data,
                    "success",
                ));
            }
            Err(e) => {
                // The failure answers this request only; subscriptions and
                // the channel itself are untouched
                self.buses.response.add(build_response(
                    "get_history",
                    request_id.as_deref(),
                    json!({ "error": e.to_string() }),
                    "error",
                ));
            }
        }
    }
}
