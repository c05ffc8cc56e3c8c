use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::request_router::RequestRouter;
use crate::ws_registry::{ObserverRegistry, OutboundFrame};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// One observer registry per WebSocket stream
pub struct Registries {
    pub gps: Arc<ObserverRegistry>,
    pub log: Arc<ObserverRegistry>,
    pub response: Arc<ObserverRegistry>,
    pub request: Arc<ObserverRegistry>,
}

impl Registries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gps: Arc::new(ObserverRegistry::new("gps")),
            log: Arc::new(ObserverRegistry::new("log")),
            response: Arc::new(ObserverRegistry::new("response")),
            // The request channel is long-lived and mostly quiet inbound;
            // periodic pings keep middleboxes from reaping it
            request: Arc::new(ObserverRegistry::with_keepalive(
                "request",
                std::time::Duration::from_secs(60),
            )),
        })
    }
}

/// Shared application state for the HTTP/WS layer
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registries: Arc<Registries>,
    pub router: Arc<RequestRouter>,
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn gps_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    observer_upgrade(ws, state.registries.gps.clone(), None)
}

async fn log_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    observer_upgrade(ws, state.registries.log.clone(), None)
}

async fn response_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    observer_upgrade(ws, state.registries.response.clone(), None)
}

async fn request_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    observer_upgrade(
        ws,
        state.registries.request.clone(),
        Some(state.router.clone()),
    )
}

/// Register the observer first, then hand the socket to its tasks. A
/// broadcast racing the handshake queues in the observer's channel and is
/// flushed once the writer starts.
fn observer_upgrade(
    ws: WebSocketUpgrade,
    registry: Arc<ObserverRegistry>,
    router: Option<Arc<RequestRouter>>,
) -> Response {
    let (frame_tx, frame_rx) = flume::unbounded::<OutboundFrame>();
    let keepalive_tx = frame_tx.clone();
    let observer_id = registry.register(frame_tx);

    ws.on_upgrade(move |socket| async move {
        if let Some(interval) = registry.keepalive_interval() {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if keepalive_tx.send(OutboundFrame::Ping).is_err() {
                        break;
                    }
                }
            });
        } else {
            drop(keepalive_tx);
        }

        run_observer_socket(socket, registry, observer_id, frame_rx, router).await;
    })
}

async fn run_observer_socket(
    socket: WebSocket,
    registry: Arc<ObserverRegistry>,
    observer_id: u64,
    frame_rx: flume::Receiver<OutboundFrame>,
    router: Option<Arc<RequestRouter>>,
) {
    metrics::counter!("ws.connections_total", "registry" => registry.name()).increment(1);

    let (mut sender, mut receiver) = socket.split();
    let registry_name = registry.name();

    let write_task = tokio::spawn(async move {
        while let Ok(frame) = frame_rx.recv_async().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Ping => Message::Ping(Vec::new().into()),
            };
            if let Err(e) = sender.send(message).await {
                debug!("[{}] WebSocket send failed: {}", registry_name, e);
                break;
            }
        }
    });

    let read_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Some(router) = &router {
                        router.handle_message(&text).await;
                    } else {
                        debug!("[{}] Inbound message ignored: {}", registry_name, text);
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("[{}] WebSocket closed by client", registry_name);
                    break;
                }
                Ok(_) => {
                    // Binary, ping, pong: nothing to do
                }
                Err(e) => {
                    let text = e.to_string();
                    if text.contains("Connection reset") {
                        debug!("[{}] WebSocket reset by client: {}", registry_name, e);
                    } else {
                        warn!("[{}] WebSocket error: {}", registry_name, e);
                    }
                    break;
                }
            }
        }
    });

    // Either side ending tears the connection down
    tokio::select! {
        _ = write_task => {}
        _ = read_task => {}
    }

    registry.unregister(observer_id);
}

/// Build the CORS layer from the configured allow-list
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

pub fn build_router(state: AppState, http_cors: CorsLayer, ws_cors: CorsLayer) -> Router {
    let ws_routes = Router::new()
        .route("/ws/gps", get(gps_websocket))
        .route("/ws/logs", get(log_websocket))
        .route("/ws/response", get(response_websocket))
        .route("/ws/request", get(request_websocket))
        .with_state(state.clone())
        .layer(ws_cors);

    let http_routes = Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(http_cors);

    http_routes
        .merge(ws_routes)
        .layer(middleware::from_fn(request_logging_middleware))
}

pub async fn start_web_server(
    interface: String,
    port: u16,
    state: AppState,
    http_cors: CorsLayer,
    ws_cors: CorsLayer,
) -> Result<()> {
    info!("Starting web server on {}:{}", interface, port);

    let app = build_router(state, http_cors, ws_cors);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app).await?;
    Ok(())
}
