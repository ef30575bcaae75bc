use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// All 255 peer indices are live. Surfaced instead of wrapping
    /// around to index 0, which would collide with the first peer's
    /// addressing.
    #[error("peer index space exhausted")]
    IndexExhausted,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("peer protocol error: {0}")]
    PeerProtocol(String),

    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("wireguard error: {0}")]
    WireGuard(String),

    /// TUN/interface bring-up failed: device busy, missing privileges,
    /// or an unsupported platform.
    #[error("platform resource error: {0}")]
    PlatformResource(String),

    #[error("bind is closed")]
    BindClosed,

    #[error(transparent)]
    Signaling(#[from] arqut_signaling::SignalingError),
}
