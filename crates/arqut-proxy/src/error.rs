use arqut_store::CatalogError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("no available ports in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("proxy already started")]
    AlreadyStarted,

    #[error("invalid bind address: {0}")]
    InvalidAddr(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
