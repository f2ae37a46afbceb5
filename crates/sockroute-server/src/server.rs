//! `BridgeServer`: axum HTTP server that upgrades registered routes to
//! WebSocket connection actors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{ConnectInfo, MatchedPath, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use sockroute_core::PeerKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::routes::RouteTable;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::actor::{ActorConfig, ConnectionActor};
use crate::websocket::registry::{ConnectionRegistry, start_prune_task};
use crate::websocket::transport::AxumTransport;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
struct AppState {
    routes: Arc<RouteTable>,
    registry: Arc<ConnectionRegistry>,
    actor_config: ActorConfig,
    start_time: Instant,
}

/// The bridge server.
pub struct BridgeServer {
    config: ServerConfig,
    routes: Arc<RouteTable>,
    registry: Arc<ConnectionRegistry>,
    actor_config: ActorConfig,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl BridgeServer {
    /// Create a server for `routes`.
    pub fn new(config: ServerConfig, routes: RouteTable) -> Self {
        let actor_config = config.actor_config();
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            routes: Arc::new(routes),
            shutdown: Arc::new(ShutdownCoordinator::new(Arc::clone(&registry))),
            registry,
            actor_config,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Replace the per-connection actor settings derived from the config.
    #[must_use]
    pub fn with_actor_config(mut self, actor_config: ActorConfig) -> Self {
        self.actor_config = actor_config;
        self
    }

    /// Build the router: every registered path, `/health`, and `/metrics`
    /// when a recorder handle is set.
    pub fn router(&self) -> Router {
        let state = AppState {
            routes: Arc::clone(&self.routes),
            registry: Arc::clone(&self.registry),
            actor_config: self.actor_config.clone(),
            start_time: self.start_time,
        };

        let mut router = Router::new().route("/health", get(health_handler));
        for path in self.routes.paths() {
            router = router.route(&path, any(ws_upgrade));
        }
        if let Some(handle) = self.metrics.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }
        router.with_state(state).layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background until the shutdown token fires.
    pub async fn listen(&self) -> Result<ServerHandle, std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let server = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(error) = serve.await {
                error!(%error, "server terminated with error");
            }
        });
        let prune = start_prune_task(Arc::clone(&self.registry), self.config.prune_interval());

        info!(%addr, routes = ?self.routes.paths(), "sockroute server listening");
        Ok(ServerHandle {
            addr,
            server,
            prune,
        })
    }

    /// Close every live connection without stopping the listener. Returns
    /// how many were closed.
    pub async fn close_all(&self) -> usize {
        self.shutdown.close_connections().await.len()
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The live connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The route table.
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// Handle returned by [`BridgeServer::listen`].
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    server: JoinHandle<()>,
    prune: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Background tasks to hand to
    /// [`ShutdownCoordinator::graceful_shutdown`]. The registry sweeper is
    /// stopped immediately.
    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.prune.abort();
        vec![self.server, self.prune]
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.live_count(),
        state.routes.paths(),
    ))
}

/// Upgrade a request on a registered path into a connection actor.
async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    matched: MatchedPath,
    method: Method,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let route = match state.routes.resolve(&method, matched.as_str()) {
        Ok(route) => route,
        Err(error) => {
            warn!(%addr, %error, "upgrade rejected");
            return (StatusCode::NOT_FOUND, error.to_string()).into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let peer = PeerKey::from(addr);
    ws.on_upgrade(move |socket| async move {
        let transport = Arc::new(AxumTransport::new(socket, peer));
        let actor = ConnectionActor::spawn(
            transport,
            route,
            headers,
            state.registry,
            state.actor_config,
        );
        actor.closed().await;
    })
}
