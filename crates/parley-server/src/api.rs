use std::sync::Arc;

use axum::{extract::State, http::Method, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::{PROTOCOL_VERSION, SOCKET_PATH};
use parley_store::Persistence;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::gateway::socket_handler;
use crate::presence::PresenceRegistry;
use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Persistence>,
    pub registry: Arc<PresenceRegistry>,
    pub relay: Relay,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Persistence>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        Self {
            relay: Relay::new(registry.clone(), store.clone()),
            store,
            registry,
            authenticator,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(SOCKET_PATH, get(socket_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_identities: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_identities: state.registry.online_count().await,
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already bound listener (tests bind port 0).
pub async fn serve_on(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP server");

    axum::serve(listener, app).await?;

    Ok(())
}
