use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rescue_core::ConnectionId;
use rescue_telemetry::metrics::names;
use rescue_telemetry::RelayMetrics;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::connection;
use crate::origin::OriginPolicy;
use crate::registry::{ConnectionRegistry, HEARTBEAT_INTERVAL};
use crate::relay::{InboundFrame, Relay};
use crate::router::RouterOptions;

const ROUTES: [(&str, &str); 3] = [("GET", "/"), ("GET", "/api/health"), ("GET", "/ws")];

const FEATURES: [&str; 4] = [
    "Real-time location tracking",
    "Shelter and hospital mapping",
    "SOS emergency services",
    "Rescue team coordination",
];

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub origins: Arc<OriginPolicy>,
    pub metrics: Arc<RelayMetrics>,
    pub inbox: mpsc::Sender<(ConnectionId, InboundFrame)>,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .origins
                .allowed()
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind, spawn the relay loop and the HTTP server. Returns a handle to shut
/// both down.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<RelayMetrics>,
) -> Result<ServerHandle, ServerError> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let shutdown = CancellationToken::new();
    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));

    let relay = Relay::new(
        Arc::clone(&registry),
        Arc::clone(&metrics),
        RouterOptions {
            relay_unknown_types: config.relay_unknown_types,
        },
    );
    let relay_handle = tokio::spawn(relay.run(inbox_rx, HEARTBEAT_INTERVAL, shutdown.clone()));

    let state = AppState {
        registry: Arc::clone(&registry),
        origins: Arc::new(OriginPolicy::new(config.allowed_origins.iter().cloned())),
        metrics,
        inbox: inbox_tx,
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(source) => {
            shutdown.cancel();
            return Err(ServerError::Bind { addr, source });
        }
    };
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        environment = %config.environment,
        origins = ?config.allowed_origins,
        "rescue relay started"
    );
    if config.is_development() {
        for (method, path) in ROUTES {
            tracing::debug!(method, path, "registered route");
        }
    }

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        server: server_handle,
        relay: relay_handle,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    relay: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop the sweep, close the listener and drop every connection.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.relay.await {
            tracing::warn!(error = %e, "relay task ended abnormally");
        }
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("rescue relay stopped");
    }
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "message": "Rescue relay API is running",
        "features": FEATURES,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "websocket": state.registry.stats(),
    }))
}

/// WebSocket upgrade, gated by the origin allow-list.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Err(err) = state.origins.admit(origin.as_deref()) {
        tracing::warn!(origin = ?origin, kind = err.error_kind(), "rejected websocket connection");
        state.metrics.counter_inc(names::CONNECTIONS_REJECTED, &[], 1);
        return (StatusCode::FORBIDDEN, err.client_message()).into_response();
    }

    let origin = origin.unwrap_or_default();
    ws.on_upgrade(move |socket| connection::serve(socket, origin, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind: [127, 0, 0, 1].into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(local_config(), Arc::new(RelayMetrics::detached()))
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/api/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "healthy");
        assert_eq!(
            body["websocket"],
            json!({"connected": 0, "rescueTeams": 0, "mapSubscribers": 0})
        );
        assert!(chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn root_lists_features() {
        let handle = start(local_config(), Arc::new(RelayMetrics::detached()))
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Rescue relay API is running");
        assert_eq!(body["features"].as_array().unwrap().len(), FEATURES.len());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = start(local_config(), Arc::new(RelayMetrics::detached()))
            .await
            .unwrap();
        let taken = ServerConfig {
            port: first.port,
            ..local_config()
        };

        let err = start(taken, Arc::new(RelayMetrics::detached()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn upgrade_from_foreign_origin_is_forbidden() {
        let handle = start(local_config(), Arc::new(RelayMetrics::detached()))
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/ws", handle.port))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Origin", "http://evil.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.text().await.unwrap(), "Invalid origin");
        assert_eq!(handle.registry().count(), 0);

        handle.shutdown().await;
    }

    #[test]
    fn build_router_creates_routes() {
        let (inbox, _rx) = mpsc::channel(8);
        let state = AppState {
            registry: Arc::new(ConnectionRegistry::new(8)),
            origins: Arc::new(OriginPolicy::new(["http://localhost:5173"])),
            metrics: Arc::new(RelayMetrics::detached()),
            inbox,
            shutdown: CancellationToken::new(),
        };
        let _router = build_router(state);
    }
}
