//! HTTP and websocket surface for the live viewer.
//!
//! The axum app serves session queries out of the storage layer, the current
//! metrics snapshot, an opaque viewer-config blob, and the `/ws` upgrade that
//! turns a connection into a broadcast subscriber. The tokio runtime is
//! confined to one server thread; the rest of the pipeline stays on plain
//! threads.
//!
//! Every response carries permissive CORS headers so the viewer can be served
//! from anywhere during development.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::broadcast::Hub;
use crate::event::EventKind;
use crate::metrics::MetricsCollector;
use crate::storage::{EventFilter, Session, SessionManager, StoreError};

/// How long graceful shutdown may wait for open connections.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub hub: Arc<Hub>,
    pub metrics: Arc<MetricsCollector>,
    pub viewer_config: Arc<RwLock<serde_json::Value>>,
}

/// Timeline defaults the viewer starts from; the core never interprets this.
pub fn default_viewer_config() -> serde_json::Value {
    serde_json::json!({
        "nanoseconds_per_pixel": 1_000_000.0,
        "state_colors": {
            "0": "#22c55e",
            "1": "#3b82f6",
            "2": "#eab308",
            "3": "#f97316",
            "4": "#ef4444",
            "5": "#a855f7",
            "6": "#64748b",
            "7": "#ec4899",
            "8": "#14b8a6",
            "9": "#f59e0b",
        },
        "type_colors": {
            "makeslice": "#3b82f6",
            "makemap": "#8b5cf6",
            "newobject": "#06b6d4",
        },
    })
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/events", get(get_events))
        .route("/api/sessions/:id/goroutines", get(get_goroutines))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/metrics", get(get_metrics))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, self.1).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> ApiError {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            StoreError::AlreadyExists(_) | StoreError::InUse(_) => StatusCode::CONFLICT,
            StoreError::Io(_) | StoreError::Parse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

async fn list_sessions(State(state): State<ApiState>) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.manager.list()?))
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.manager.get(&id)?))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    goroutine: Option<u32>,
    event_type: Option<u64>,
    start_time: Option<u64>,
    end_time: Option<u64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<crate::storage::Event>>, ApiError> {
    let event_type = query
        .event_type
        .map(|raw| {
            EventKind::try_from(raw).map_err(|reason| ApiError(StatusCode::BAD_REQUEST, reason))
        })
        .transpose()?;

    let filter = EventFilter {
        goroutine: query.goroutine,
        event_type,
        start_time: query.start_time,
        end_time: query.end_time,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };

    let store = state.manager.open(&id)?;
    let scan = store.scan(&filter)?;
    if let Some(diagnostic) = &scan.diagnostic {
        warn!(session = %id, %diagnostic, "scan stopped at damaged tail");
    }
    Ok(Json(scan.events))
}

async fn get_goroutines(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<u32>>, ApiError> {
    let store = state.manager.open(&id)?;
    let goroutines = store.unique_goroutines()?;
    Ok(Json(goroutines.into_iter().collect()))
}

async fn get_config(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.viewer_config.read().unwrap().clone())
}

async fn post_config(
    State(state): State<ApiState>,
    Json(config): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    *state.viewer_config.write().unwrap() = config.clone();
    Json(config)
}

async fn get_metrics(State(state): State<ApiState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.latest())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

/// Pump the subscriber's frame ring into the socket until either side goes
/// away. Frames already queued are delivered before an eviction closes the
/// connection.
async fn serve_subscriber(mut socket: WebSocket, state: ApiState) {
    let subscriber = state.hub.subscribe();
    debug!(subscriber = subscriber.id(), "websocket viewer connected");

    loop {
        tokio::select! {
            _ = subscriber.wait() => {
                while let Some(frame) = subscriber.pop() {
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        state.hub.unsubscribe(subscriber.id());
                        return;
                    }
                }
                if subscriber.is_closed() {
                    let _ = socket.send(Message::Close(None)).await;
                    state.hub.unsubscribe(subscriber.id());
                    return;
                }
            }
            msg = socket.recv() => {
                match msg {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {
                        state.hub.unsubscribe(subscriber.id());
                        debug!(subscriber = subscriber.id(), "websocket viewer disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// The API server, running its own tokio runtime on a named thread.
pub struct ApiServer {
    stop: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ApiServer {
    /// Bind the listen socket and start serving. Binding happens here,
    /// synchronously, so a taken port fails startup instead of surfacing
    /// later from the server thread.
    pub fn bind(state: ApiState, port: u16) -> Result<ApiServer> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("binding api server to port {port}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (stop, stop_rx) = watch::channel(false);
        let thread = thread::Builder::new()
            .name("api-server".to_string())
            .spawn(move || serve(listener, state, stop_rx))?;

        info!(%local_addr, "api server listening");
        Ok(ApiServer {
            stop,
            thread: Some(thread),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful stop, bounded by [`SHUTDOWN_DEADLINE`].
    pub fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(listener: std::net::TcpListener, state: ApiState, stop_rx: watch::Receiver<bool>) {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(%e, "failed to build api runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(%e, "failed to adopt api listener");
                return;
            }
        };
        let app = router(state);

        let mut graceful_rx = stop_rx.clone();
        let graceful = async move {
            let _ = graceful_rx.changed().await;
        };

        let mut deadline_rx = stop_rx;
        let deadline = async move {
            let _ = deadline_rx.changed().await;
            tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(graceful);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(%e, "api server error");
                }
            }
            _ = deadline => {
                warn!("api server shutdown deadline elapsed, dropping open connections");
            }
        }
    });
}
