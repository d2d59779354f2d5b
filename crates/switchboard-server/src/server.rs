//! `SwitchboardServer`: axum HTTP + WebSocket front door.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use switchboard_core::DispatchError;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection::RequestMetadata;
use crate::dispatcher::Dispatcher;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::split_websocket;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dispatcher serving upgraded connections.
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator; connection scopes derive from its token.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

/// The switchboard server.
pub struct SwitchboardServer {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl SwitchboardServer {
    /// Create a server around a built dispatcher.
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Expose `/metrics` rendered from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    ///
    /// # Panics
    ///
    /// Panics if `ws_path` collides with another route or is not a valid path.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        let mut router = Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state);
        if let Some(handle) = self.metrics.clone() {
            router = router.merge(
                Router::new()
                    .route("/metrics", get(metrics_handler))
                    .with_state(handle),
            );
        }
        router
    }

    /// Bind and serve in a background task until shutdown.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, ws_path = %self.config.ws_path, "switchboard listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Whether the request's `Origin` may open a connection.
///
/// No `Origin` header is always allowed. With an empty allow-list the origin's
/// authority must equal the `Host` header.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    if !allowed.is_empty() {
        return allowed
            .iter()
            .any(|a| a == "*" || a.eq_ignore_ascii_case(origin));
    }
    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .trim_end_matches('/');
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|host| host.eq_ignore_ascii_case(authority))
}

/// GET {ws_path}
async fn ws_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // `get` also routes HEAD.
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|o| o.to_str().ok())
            .unwrap_or_default();
        let err = DispatchError::Upgrade(format!("origin not allowed: {origin}"));
        state.dispatcher.report(None, &err);
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = DispatchError::Upgrade(rejection.body_text());
            state.dispatcher.report(None, &err);
            return rejection.into_response();
        }
    };

    let metadata = RequestMetadata::new(method, uri, headers);
    let dispatcher = Arc::clone(&state.dispatcher);
    let on_failure = Arc::clone(&state.dispatcher);
    let scope = state.shutdown.token();

    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(move |e: axum::Error| {
            on_failure.report(None, &DispatchError::Upgrade(e.to_string()));
        })
        .on_upgrade(move |socket| async move {
            let (reader, writer) = split_websocket(socket);
            let _ = dispatcher.serve(reader, writer, metadata, &scope).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.dispatcher.active_connections(),
        state.dispatcher.registry().topics(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
