//! SQLite-backed service catalog.
//!
//! The catalog is the single source of truth for published services; the
//! service manager's in-memory listener state is derived from it and can
//! always be rebuilt by re-reading the rows.

pub mod catalog;
pub mod entities;
pub mod error;
pub mod ids;
pub mod migrator;

pub use catalog::{NewService, ServiceCatalog, ServicePatch};
pub use error::CatalogError;

use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Open (creating if needed) the catalog database at `path` and run
/// pending migrations.
pub async fn open(path: &str) -> Result<DatabaseConnection, CatalogError> {
    let url = format!("sqlite://{path}?mode=rwc");
    let db = Database::connect(&url).await?;
    migrator::Migrator::up(&db, None).await?;
    info!(path, "catalog database opened");
    Ok(db)
}

/// Open a private in-memory catalog. Used by tests and available for
/// ephemeral runs.
pub async fn open_in_memory() -> Result<DatabaseConnection, CatalogError> {
    let db = Database::connect("sqlite::memory:").await?;
    migrator::Migrator::up(&db, None).await?;
    Ok(db)
}
