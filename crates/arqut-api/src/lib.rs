//! Local HTTP API: thin CRUD over the service manager plus read-only
//! views of the peer tunnels.

pub mod handlers;
pub mod models;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, patch, put};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use arqut_proxy::ServiceManager;
use arqut_tunnel::TunnelCoordinator;

/// Shared state for every handler.
pub struct AppState {
    pub manager: ServiceManager,
    /// Absent when the agent runs without cloud connectivity.
    pub tunnels: Option<TunnelCoordinator>,
}

/// OpenAPI documentation for the service endpoints.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Arqut Edge API",
        description = "Local management API for the Arqut edge agent"
    ),
    paths(
        handlers::list_services,
        handlers::create_service,
        handlers::update_service,
        handlers::enable_service,
        handlers::disable_service,
        handlers::delete_service,
        handlers::health,
    ),
    components(schemas(
        models::CreateServiceRequest,
        models::UpdateServiceRequest,
        models::ServiceResponse,
        models::HealthResponse,
    ))
)]
pub struct ApiDoc;

/// Build the router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            let origin = origin.to_str().unwrap_or("");
            origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
        }));

    Router::new()
        .route(
            "/api/services",
            get(handlers::list_services).post(handlers::create_service),
        )
        .route(
            "/api/services/{id}",
            put(handlers::update_service).delete(handlers::delete_service),
        )
        .route("/api/services/{id}/enable", patch(handlers::enable_service))
        .route(
            "/api/services/{id}/disable",
            patch(handlers::disable_service),
        )
        .route("/health", get(handlers::health))
        .route("/api/wireguard/peers", get(handlers::list_peers))
        .route(
            "/api/wireguard/peers/{id}",
            get(handlers::get_peer).delete(handlers::disconnect_peer),
        )
        .route(
            "/api/wireguard/interfaces",
            get(handlers::list_interfaces),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve the API until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
