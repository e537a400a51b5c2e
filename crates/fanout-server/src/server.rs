//! `FanoutServer`: Axum HTTP + WebSocket server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use fanout_core::{AccountId, ChannelId, ConnectionId, HandshakeError, HostId, RelayEnvelope};
use fanout_presence::{ChannelDirectory, PresenceDirectory};
use futures::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{
    ACCOUNT_HEADER, ApiError, BroadcastRequest, ConnectQuery, DirectMessageRequest,
    SubscribeRequest,
};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_HANDSHAKE_REJECTIONS_TOTAL;
use crate::registry::ConnectionRegistry;
use crate::router::{DeliveryReport, MessageRouter};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::InterHostTransport;
use crate::websocket::lifecycle::{ConnectionLifecycle, handshake};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Local connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Message router.
    pub router: Arc<MessageRouter>,
    /// Per-connection lifecycle driver.
    pub lifecycle: Arc<ConnectionLifecycle>,
    /// Channel membership.
    pub channels: ChannelDirectory,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// This host's id.
    pub host: HostId,
    /// When the server started.
    pub start_time: Instant,
    /// Connection limit.
    pub max_connections: usize,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The fan-out server for one host.
pub struct FanoutServer {
    config: ServerConfig,
    host: HostId,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceDirectory,
    channels: ChannelDirectory,
    router: Arc<MessageRouter>,
    lifecycle: Arc<ConnectionLifecycle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl FanoutServer {
    /// Create a server for `host` over the given directories and transport.
    pub fn new(
        config: ServerConfig,
        host: HostId,
        presence: PresenceDirectory,
        channels: ChannelDirectory,
        transport: Arc<dyn InterHostTransport>,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(
            host.clone(),
            registry.clone(),
            presence.clone(),
            channels.clone(),
            transport,
        ));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            host.clone(),
            registry.clone(),
            presence.clone(),
            config.lifecycle(),
            shutdown.token(),
        ));
        Self {
            config,
            host,
            registry,
            presence,
            channels,
            router,
            lifecycle,
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            router: self.router.clone(),
            lifecycle: self.lifecycle.clone(),
            channels: self.channels.clone(),
            shutdown: self.shutdown.clone(),
            host: self.host.clone(),
            start_time: self.start_time,
            max_connections: self.config.max_connections,
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/hello", get(hello_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/connect", get(connect_handler))
            .route("/direct_message", post(direct_message_handler))
            .route("/send_message", post(send_message_handler))
            .route("/channels/{channel}/subscribers", post(subscribe_handler))
            .route(
                "/channels/{channel}/subscribers/{account}",
                delete(unsubscribe_handler),
            )
            .route("/relay", post(relay_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until shutdown.
    ///
    /// Returns the bound address and the server task.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, host = %self.host, "fanout server listening");
        Ok((addr, handle))
    }

    /// Bind the configured address and serve.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = bind(&self.config).await?;
        self.serve(listener).await
    }

    /// This host's id.
    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Local connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Presence directory.
    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    /// Channel directory.
    pub fn channels(&self) -> &ChannelDirectory {
        &self.channels
    }

    /// Message router.
    pub fn message_router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Bind `config.host:config.port`.
pub async fn bind(config: &ServerConfig) -> io::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port)).await
}

/// Compute this host's externally reachable id.
///
/// Uses `advertise` when set. Otherwise the bound address, except that an
/// unspecified bind address (`0.0.0.0`, `::`) is replaced by `$HOSTNAME`.
pub fn resolve_host_id(advertise: Option<&str>, local: SocketAddr) -> HostId {
    if let Some(id) = advertise.and_then(HostId::parse) {
        return id;
    }
    if local.ip().is_unspecified() {
        let name = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_owned());
        return HostId::from(format!("{name}:{}", local.port()));
    }
    HostId::from(local.to_string())
}

/// GET /hello
async fn hello_handler() -> &'static str {
    "Hello, World!"
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.host.as_str(),
        state.registry.connection_count(),
        state.registry.account_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /connect: WebSocket upgrade.
///
/// The account comes from the `AccountId` header, falling back to the
/// `account` query parameter.
async fn connect_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let account = admit(&state, &headers, &query).inspect_err(|e| {
        counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "code" => e.code()).increment(1);
        debug!(%peer, error = %e, "handshake rejected");
    })?;
    let conn_id = ConnectionId::for_peer(&peer);
    let lifecycle = state.lifecycle.clone();
    let tracked = state.shutdown.track_connection();

    Ok(ws
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (writer, reader) = socket.split();
            let _ = lifecycle.run(reader, writer, account, conn_id).await;
            drop(tracked);
        }))
}

fn admit(
    state: &AppState,
    headers: &HeaderMap,
    query: &ConnectQuery,
) -> Result<AccountId, HandshakeError> {
    if state.shutdown.is_shutting_down() {
        return Err(HandshakeError::ShuttingDown);
    }
    let raw = headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.account.as_deref());
    let account = handshake(raw)?;
    if state.registry.connection_count() >= state.max_connections {
        return Err(HandshakeError::AtCapacity {
            limit: state.max_connections,
        });
    }
    Ok(account)
}

/// POST /direct_message
async fn direct_message_handler(
    State(state): State<AppState>,
    Json(req): Json<DirectMessageRequest>,
) -> Result<StatusCode, ApiError> {
    let (source, target) = req.accounts()?;
    let _ = state.router.direct(source, target, req.content).await;
    Ok(StatusCode::ACCEPTED)
}

/// POST /send_message
async fn send_message_handler(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<StatusCode, ApiError> {
    let (channel, author) = req.target()?;
    let _ = state.router.broadcast(channel, author, req.content).await;
    Ok(StatusCode::ACCEPTED)
}

/// POST /channels/{channel}/subscribers
async fn subscribe_handler(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(req): Json<SubscribeRequest>,
) -> Result<StatusCode, ApiError> {
    let (channel, account) = channel_member(&channel, &req.account_id)?;
    state.channels.subscribe(&channel, &account).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /channels/{channel}/subscribers/{account}
async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path((channel, account)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let (channel, account) = channel_member(&channel, &account)?;
    state.channels.unsubscribe(&channel, &account).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn channel_member(channel: &str, account: &str) -> Result<(ChannelId, AccountId), ApiError> {
    let channel = ChannelId::parse(channel)
        .ok_or_else(|| ApiError::BadRequest("channel must not be blank".into()))?;
    let account = AccountId::parse(account)
        .ok_or_else(|| ApiError::BadRequest("accountId must not be blank".into()))?;
    Ok((channel, account))
}

/// POST /relay: ingress for relays from sibling hosts.
async fn relay_handler(
    State(state): State<AppState>,
    Json(envelope): Json<RelayEnvelope>,
) -> Result<(StatusCode, Json<DeliveryReport>), ApiError> {
    let report = state.router.handle_relay(envelope).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}
