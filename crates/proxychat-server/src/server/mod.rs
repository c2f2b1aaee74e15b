use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use proxychat_delivery::DeliveryService;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

mod routes;

/// Server application state
pub struct AppState {
    /// Delivery components of this process
    pub delivery: DeliveryService,
    /// Cancelled on shutdown; open sessions watch it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(delivery: DeliveryService, shutdown: CancellationToken) -> Self {
        Self { delivery, shutdown }
    }
}

/// Start the HTTP server with graceful shutdown support.
pub async fn start(state: Arc<AppState>, listener: tokio::net::TcpListener) -> Result<()> {
    let stop_token = state.shutdown.clone();
    let app = create_router(state);

    let addr = listener.local_addr()?;
    info!("Starting Axum HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop_token.cancelled().await;
            info!("HTTP server received shutdown signal, draining connections");
        })
        .await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    let websocket_router = routes::websocket::router(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(detailed_health_handler))
        .with_state(state)
        .merge(websocket_router)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

/// Response for detailed health check
#[derive(Debug, Serialize)]
struct DetailedHealthResponse {
    status: String,
    service: String,
    version: String,
    instance_id: String,
    store: StoreHealthStatus,
    connections: usize,
}

#[derive(Debug, Serialize)]
struct StoreHealthStatus {
    status: String,
    healthy: bool,
}

/// Simple health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.delivery.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "proxychat-server",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "proxychat-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": format!("store error: {}", e)
                })),
            )
        }
    }
}

/// Detailed health check endpoint (for monitoring)
async fn detailed_health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status_code, status, store) = match state.delivery.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            "healthy",
            StoreHealthStatus {
                status: "healthy".to_string(),
                healthy: true,
            },
        ),
        Err(e) => {
            warn!("Detailed health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "unhealthy",
                StoreHealthStatus {
                    status: format!("error: {}", e),
                    healthy: false,
                },
            )
        }
    };

    (
        status_code,
        Json(DetailedHealthResponse {
            status: status.to_string(),
            service: "proxychat-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.delivery.instance_id().to_string(),
            store,
            connections: state.delivery.registry.connection_count(),
        }),
    )
}
