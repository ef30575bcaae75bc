//! HTTP handlers for the local API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use tracing::error;

use arqut_proto::Protocol;
use arqut_store::ServicePatch;

use crate::models::{CreateServiceRequest, HealthResponse, ServiceResponse, UpdateServiceRequest};
use crate::response::{created, error as error_resp, proxy_error, success, success_empty};
use crate::AppState;

/// Accepts `ws` as an alias for the canonical `websocket` spelling.
fn parse_protocol(raw: Option<&str>) -> Result<Protocol, Response> {
    let raw = raw.unwrap_or("http");
    let normalized = if raw == "ws" { "websocket" } else { raw };
    Protocol::parse(normalized).ok_or_else(|| {
        error_resp(
            StatusCode::BAD_REQUEST,
            format!("unsupported protocol: {raw} (supported: http, websocket)"),
        )
    })
}

fn parse_port(port: i64) -> Result<u16, Response> {
    if !(1..=65535).contains(&port) {
        return Err(error_resp(
            StatusCode::BAD_REQUEST,
            format!("invalid local port: {port}"),
        ));
    }
    Ok(port as u16)
}

/// GET /api/services: all services, oldest first.
#[utoipa::path(get, path = "/api/services", responses((status = 200, body = [ServiceResponse])))]
pub async fn list_services(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.list_services().await {
        Ok(services) => {
            let mut list: Vec<ServiceResponse> =
                services.into_iter().map(ServiceResponse::from).collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            success(list)
        }
        Err(err) => {
            error!(error = %err, "failed to list services");
            proxy_error(&err)
        }
    }
}

/// POST /api/services: create a service.
#[utoipa::path(post, path = "/api/services", request_body = CreateServiceRequest,
    responses((status = 201, body = ServiceResponse), (status = 400)))]
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServiceRequest>,
) -> Response {
    let (Some(name), Some(local_host)) = (req.name.as_deref(), req.local_host.as_deref()) else {
        return error_resp(
            StatusCode::BAD_REQUEST,
            "Missing required fields (name, local_host)",
        );
    };
    let protocol = match parse_protocol(req.protocol.as_deref()) {
        Ok(protocol) => protocol,
        Err(response) => return response,
    };
    let local_port = match parse_port(req.local_port.unwrap_or(0)) {
        Ok(port) => port,
        Err(response) => return response,
    };

    match state
        .manager
        .add_service(name, local_host, local_port, protocol)
        .await
    {
        Ok(model) => created(ServiceResponse::from(model)),
        Err(err) => {
            error!(error = %err, "failed to create service");
            proxy_error(&err)
        }
    }
}

/// PUT /api/services/{id}: partial update.
#[utoipa::path(put, path = "/api/services/{id}", request_body = UpdateServiceRequest,
    responses((status = 200), (status = 404)))]
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateServiceRequest>,
) -> Response {
    if matches!(req.name.as_deref(), Some("")) {
        return error_resp(StatusCode::BAD_REQUEST, "Name cannot be empty");
    }
    if matches!(req.local_host.as_deref(), Some("")) {
        return error_resp(StatusCode::BAD_REQUEST, "Local host cannot be empty");
    }
    let local_port = match req.local_port {
        Some(port) => match parse_port(port) {
            Ok(port) => Some(port),
            Err(response) => return response,
        },
        None => None,
    };

    let patch = ServicePatch {
        name: req.name,
        local_host: req.local_host,
        local_port,
        enabled: req.enabled,
    };
    match state.manager.modify_service(&id, patch).await {
        Ok(_) => success_empty(),
        Err(err) => {
            error!(error = %err, "failed to update service");
            proxy_error(&err)
        }
    }
}

/// PATCH /api/services/{id}/enable
#[utoipa::path(patch, path = "/api/services/{id}/enable", responses((status = 200), (status = 404)))]
pub async fn enable_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.enable_service(&id).await {
        Ok(_) => success_empty(),
        Err(err) => proxy_error(&err),
    }
}

/// PATCH /api/services/{id}/disable
#[utoipa::path(patch, path = "/api/services/{id}/disable", responses((status = 200), (status = 404)))]
pub async fn disable_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.disable_service(&id).await {
        Ok(_) => success_empty(),
        Err(err) => proxy_error(&err),
    }
}

/// DELETE /api/services/{id}
#[utoipa::path(delete, path = "/api/services/{id}", responses((status = 200), (status = 404)))]
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.delete_service(&id).await {
        Ok(()) => success_empty(),
        Err(err) => {
            error!(error = %err, "failed to delete service");
            proxy_error(&err)
        }
    }
}

/// GET /health
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

// ---------------------------------------------------------------------
// WireGuard endpoints
// ---------------------------------------------------------------------

fn tunnels_of(state: &AppState) -> Result<&arqut_tunnel::TunnelCoordinator, Response> {
    state.tunnels.as_ref().ok_or_else(|| {
        error_resp(
            StatusCode::SERVICE_UNAVAILABLE,
            "WireGuard service not available",
        )
    })
}

/// GET /api/wireguard/peers
pub async fn list_peers(State(state): State<Arc<AppState>>) -> Response {
    match tunnels_of(&state) {
        Ok(tunnels) => success(serde_json::json!({ "peers": tunnels.connected_peers().await })),
        Err(response) => response,
    }
}

/// GET /api/wireguard/peers/{id}
pub async fn get_peer(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match tunnels_of(&state) {
        Ok(tunnels) => match tunnels.peer_info(&id).await {
            Some(info) => success(info),
            None => error_resp(StatusCode::NOT_FOUND, format!("peer not found: {id}")),
        },
        Err(response) => response,
    }
}

/// DELETE /api/wireguard/peers/{id}
pub async fn disconnect_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match tunnels_of(&state) {
        Ok(tunnels) => match tunnels.disconnect_peer(&id).await {
            Ok(()) => success(serde_json::json!({ "message": "Peer disconnected" })),
            Err(err) => error_resp(StatusCode::NOT_FOUND, err.to_string()),
        },
        Err(response) => response,
    }
}

/// GET /api/wireguard/interfaces
pub async fn list_interfaces(State(state): State<Arc<AppState>>) -> Response {
    match tunnels_of(&state) {
        Ok(tunnels) => success(serde_json::json!({ "interfaces": tunnels.interface_ips().await })),
        Err(response) => response,
    }
}
