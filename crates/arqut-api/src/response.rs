//! The `{success, data, error, meta}` response envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use arqut_proxy::ProxyError;
use arqut_store::CatalogError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

pub fn success<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
        meta: None,
    })
    .into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
        }),
    )
        .into_response()
}

pub fn success_empty() -> Response {
    success(serde_json::Value::Null)
}

pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(ApiError {
            code: Some(status.as_u16()),
            message: message.into(),
            status: Some(status.as_u16()),
            detail: None,
        }),
        meta: None,
    };
    (status, Json(body)).into_response()
}

/// Map the manager's error taxonomy onto HTTP statuses.
pub fn proxy_error(err: &ProxyError) -> Response {
    let status = match err {
        ProxyError::Catalog(CatalogError::Invalid(_)) => StatusCode::BAD_REQUEST,
        ProxyError::Catalog(CatalogError::NotFound(_)) => StatusCode::NOT_FOUND,
        ProxyError::Catalog(CatalogError::Conflict(_)) => StatusCode::CONFLICT,
        ProxyError::Catalog(CatalogError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::AlreadyStarted => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}
