//! Service catalog repository.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use tracing::debug;

use crate::entities::service::{self, Entity as Service};
use crate::error::CatalogError;
use crate::ids;
use arqut_proto::Protocol;

/// Fields required to create a service row. The tunnel port is allocated
/// by the caller before insertion.
#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub tunnel_port: u16,
    pub protocol: Protocol,
}

/// Partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub enabled: Option<bool>,
}

impl ServicePatch {
    pub fn enabled(value: bool) -> Self {
        Self {
            enabled: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.local_host.is_none()
            && self.local_port.is_none()
            && self.enabled.is_none()
    }
}

/// Repository over the services table. Cheap to clone; every clone shares
/// the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    db: DatabaseConnection,
}

impl ServiceCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// All services, name ascending.
    pub async fn list(&self) -> Result<Vec<service::Model>, CatalogError> {
        Ok(Service::find()
            .order_by_asc(service::Column::Name)
            .all(&self.db)
            .await?)
    }

    pub async fn get(&self, id: &str) -> Result<service::Model, CatalogError> {
        Service::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub async fn get_by_host_port(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Option<service::Model>, CatalogError> {
        Ok(Service::find()
            .filter(service::Column::LocalHost.eq(host))
            .filter(service::Column::LocalPort.eq(port as i32))
            .one(&self.db)
            .await?)
    }

    /// Insert a validated row. Fails with `Conflict` when a service with
    /// the same (local_host, local_port) already exists.
    pub async fn add(&self, new: NewService) -> Result<service::Model, CatalogError> {
        validate_name(&new.name)?;
        validate_host(&new.local_host)?;
        validate_port(new.local_port)?;

        if self
            .get_by_host_port(&new.local_host, new.local_port)
            .await?
            .is_some()
        {
            return Err(CatalogError::Conflict(format!(
                "service for {}:{} already exists",
                new.local_host, new.local_port
            )));
        }

        let now = Utc::now();
        let row = service::ActiveModel {
            id: Set(ids::short_id()),
            name: Set(new.name),
            tunnel_port: Set(new.tunnel_port as i32),
            local_host: Set(new.local_host),
            local_port: Set(new.local_port as i32),
            protocol: Set(new.protocol.as_str().to_string()),
            enabled: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let model = row.insert(&self.db).await?;
        debug!(id = %model.id, name = %model.name, "service added");
        Ok(model)
    }

    /// Apply a partial update and return the new row.
    pub async fn update(
        &self,
        id: &str,
        patch: ServicePatch,
    ) -> Result<service::Model, CatalogError> {
        if patch.is_empty() {
            return Err(CatalogError::Invalid("no fields to update".into()));
        }
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(host) = &patch.local_host {
            validate_host(host)?;
        }
        if let Some(port) = patch.local_port {
            validate_port(port)?;
        }

        let mut row: service::ActiveModel = self.get(id).await?.into();
        if let Some(name) = patch.name {
            row.name = Set(name);
        }
        if let Some(host) = patch.local_host {
            row.local_host = Set(host);
        }
        if let Some(port) = patch.local_port {
            row.local_port = Set(port as i32);
        }
        if let Some(enabled) = patch.enabled {
            row.enabled = Set(enabled);
        }
        row.updated_at = Set(Utc::now());

        Ok(row.update(&self.db).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        let res = Service::delete_by_id(id).exec(&self.db).await?;
        if res.rows_affected == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, CatalogError> {
        Ok(Service::find().count(&self.db).await?)
    }

    /// Remove every row.
    pub async fn clear(&self) -> Result<(), CatalogError> {
        Service::delete_many().exec(&self.db).await?;
        Ok(())
    }

    /// Tunnel ports of every service, enabled or not.
    pub async fn used_tunnel_ports(&self) -> Result<Vec<u16>, CatalogError> {
        let ports: Vec<i32> = Service::find()
            .select_only()
            .column(service::Column::TunnelPort)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(ports.into_iter().map(|p| p as u16).collect())
    }
}

fn validate_name(name: &str) -> Result<(), CatalogError> {
    if name.is_empty() {
        return Err(CatalogError::Invalid("service name cannot be empty".into()));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), CatalogError> {
    if host.is_empty() {
        return Err(CatalogError::Invalid("local host cannot be empty".into()));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<(), CatalogError> {
    if port == 0 {
        return Err(CatalogError::Invalid(format!("invalid local port: {port}")));
    }
    Ok(())
}
