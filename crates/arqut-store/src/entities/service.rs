//! Service entity: one published local endpoint.

use arqut_proto::{Protocol, ServiceRecord};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "services")]
pub struct Model {
    /// 8-character alphanumeric id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    /// Public-facing port the edge listens on for this service.
    /// Unique across the whole table, enabled or not.
    #[sea_orm(unique)]
    pub tunnel_port: i32,

    pub local_host: String,
    pub local_port: i32,

    /// `http` or `websocket`.
    pub protocol: String,

    pub enabled: bool,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ServiceRecord {
    fn from(m: Model) -> Self {
        ServiceRecord {
            protocol: Protocol::parse(&m.protocol).unwrap_or(Protocol::Http),
            id: m.id,
            name: m.name,
            tunnel_port: m.tunnel_port as u16,
            local_host: m.local_host,
            local_port: m.local_port as u16,
            enabled: m.enabled,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}
