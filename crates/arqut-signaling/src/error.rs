use thiserror::Error;

/// Error type returned by registered message / on-connect handlers.
/// Handler failures are logged by the client and never fatal.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not connected to signaling server")]
    NotConnected,

    #[error("connect() has not been called")]
    NotConfigured,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("outbound queue is full")]
    QueueFull,
}
