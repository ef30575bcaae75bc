//! API request and response bodies.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use arqut_store::entities::service;

/// `POST /api/services` body. Everything optional so validation can
/// answer with a proper 400 instead of a deserialization error.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateServiceRequest {
    pub name: Option<String>,
    pub protocol: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<i64>,
}

/// `PUT /api/services/{id}` body. Absent fields stay unchanged.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceResponse {
    pub id: String,
    pub name: String,
    pub tunnel_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: String,
    pub enabled: bool,
    pub created_at: String,
}

impl From<service::Model> for ServiceResponse {
    fn from(m: service::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            tunnel_port: m.tunnel_port as u16,
            local_host: m.local_host,
            local_port: m.local_port as u16,
            protocol: m.protocol,
            enabled: m.enabled,
            created_at: m.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
