use thiserror::Error;

/// Error taxonomy for catalog operations.
///
/// `Invalid`, `NotFound` and `Conflict` are caller errors and surface
/// through the HTTP API with matching status codes; `Storage` is a backing
/// store failure.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid service data: {0}")]
    Invalid(String),

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
}
