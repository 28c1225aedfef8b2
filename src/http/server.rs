//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with the stream, preflight and health handlers
//! - Wire up middleware (request ID, tracing)
//! - Build the production gateway (reqwest fetcher, in-memory rate store,
//!   buffered tracing sink)
//! - Serve plain TCP or TLS with graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::http::request::StreamRequest;
use crate::http::response::preflight;
use crate::lifecycle::Shutdown;
use crate::observability::{ChannelSink, TracingSink};
use crate::relay::ReqwestFetcher;
use crate::security::rate_limit::InMemoryStore;
use crate::security::ssrf::SsrfGuard;

/// How long TLS connections get to finish after shutdown starts.
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid security rule: {0}")]
    Rules(#[from] regex::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub trust_forwarded_for: bool,
}

/// HTTP server for the streaming gateway.
pub struct HttpServer {
    router: Router,
    config: GatewayConfig,
    gateway: Arc<Gateway>,
}

impl HttpServer {
    /// Build the production gateway and its router. Must run inside a Tokio
    /// runtime: the event sink spawns its drain task here.
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        let fetcher = ReqwestFetcher::new(
            &config.upstream,
            SsrfGuard::new(config.security.domain_allowlist.clone()),
        )?;
        let (sink, _drain) =
            ChannelSink::spawn(Arc::new(TracingSink), config.observability.event_buffer);
        let gateway = Gateway::new(
            &config,
            Arc::new(fetcher),
            Arc::new(InMemoryStore::new()),
            Arc::new(sink),
        )?;

        Ok(Self::with_gateway(config, Arc::new(gateway)))
    }

    /// Serve an already assembled gateway.
    pub fn with_gateway(config: GatewayConfig, gateway: Arc<Gateway>) -> Self {
        let state = AppState {
            gateway: gateway.clone(),
            trust_forwarded_for: config.security.trust_forwarded_for,
        };
        let router = Self::build_router(state);
        Self {
            router,
            config,
            gateway,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route(
                "/stream",
                get(stream_handler)
                    .head(stream_handler)
                    .options(preflight_handler),
            )
            .route("/healthz", get(health_handler))
            .fallback(not_found)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        self.gateway
            .limiter()
            .clone()
            .spawn_eviction(shutdown.subscribe());

        let mut stop = shutdown.subscribe();
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server behind TLS termination.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: &Shutdown,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        self.gateway
            .limiter()
            .clone()
            .spawn_eviction(shutdown.subscribe());

        let handle = axum_server::Handle::new();
        let mut stop = shutdown.subscribe();
        let drain = handle.clone();
        tokio::spawn(async move {
            let _ = stop.recv().await;
            tracing::info!("Shutdown signal received");
            drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// `GET|HEAD /stream?url=...`
async fn stream_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request = StreamRequest::from_http(&request, peer.ip(), state.trust_forwarded_for);
    tracing::debug!(
        request_id = %request.request_id,
        method = %request.method,
        client_ip = %request.client_ip,
        "Stream request received"
    );
    state.gateway.handle(request).await
}

/// `OPTIONS /stream`
async fn preflight_handler() -> Response {
    preflight()
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> Response {
    GatewayError::NotFound.into_response()
}
