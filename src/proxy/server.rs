// Proxy Server - Route assembly, middleware stack, and server lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::sync::{oneshot, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::models::GatewayConfig;
use crate::proxy::config::SharedSettings;
use crate::proxy::forward::ForwardService;
use crate::proxy::handlers::{self, AppState, RoundRobinSelector};
use crate::proxy::middleware::{cors_layer, monitor_middleware};
use crate::proxy::rate_limit::InMemoryRateLimits;
use crate::proxy::token_manager::StaticTokenProvider;
use crate::proxy::upstream::{ReqwestUpstream, UpstreamError};

// ============================================================================
// Health check handler
// ============================================================================

async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

// ============================================================================
// Route builders
// ============================================================================

/// Build the proxy router (Claude + Gemini native).
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .route("/healthz", get(health_check_handler))
        // Claude Protocol
        .route("/v1/messages", post(handlers::claude::handle_messages))
        // Gemini Protocol (Native), `{model}:{action}` in one segment
        .route("/v1beta/models/:model_action", post(handlers::gemini::handle_generate))
        .with_state(state)
        // Axum layers execute bottom-to-top for requests
        .layer(axum::middleware::from_fn(monitor_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Wire the default collaborators from configuration.
pub fn build_state(settings: SharedSettings) -> Result<AppState, UpstreamError> {
    let config = settings.snapshot();
    let upstream = Arc::new(ReqwestUpstream::new(&config.upstream)?);
    let rate_limits = Arc::new(InMemoryRateLimits::new());
    let selector = Arc::new(RoundRobinSelector::new(config.accounts.clone(), rate_limits.clone()));

    let forward = Arc::new(ForwardService::new(
        upstream,
        Arc::new(StaticTokenProvider),
        rate_limits.clone(),
        rate_limits,
        Arc::new(settings),
    ));

    info!(
        "[Server] {} account(s) loaded, upstream {}",
        selector.len(),
        config.upstream.base_url
    );
    Ok(AppState::new(forward, selector))
}

// ============================================================================
// Server lifecycle
// ============================================================================

pub struct AxumServer {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    local_addr: SocketAddr,
}

impl AxumServer {
    /// Bind and start serving in a background task
    pub async fn start(
        config: &GatewayConfig,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = build_router(state, config.server.body_limit);

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        info!("Proxy server started at http://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    info!("Proxy server shutting down");
                })
                .await;
            if let Err(e) = result {
                error!("Proxy server error: {}", e);
            }
        });

        Ok((
            Self {
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                local_addr,
            },
            handle,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the proxy server
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
            info!("Proxy server stop signal sent");
        }
    }
}
