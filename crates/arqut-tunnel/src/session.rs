//! One WebRTC session with a peer, in the answerer role.
//!
//! libdatachannel drives its callbacks from its own threads; the
//! handlers only forward events into a tokio channel consumed by the
//! coordinator's per-session pump.

use std::sync::{Arc, Mutex};

use datachannel::{
    ConnectionState, DataChannelHandler, DataChannelInfo, GatheringState, IceCandidate,
    PeerConnectionHandler, RtcConfig, RtcDataChannel, RtcPeerConnection, SdpType,
    SessionDescription,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bind::WrtcBind;
use crate::error::TunnelError;
use crate::wg::WgTunnel;
use arqut_proto::TurnCredentials;

/// Label of the single data channel carrying WireGuard datagrams.
pub(crate) const WIREGUARD_CHANNEL: &str = "wireguard";

pub(crate) const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Events surfaced by the libdatachannel callbacks.
pub(crate) enum SessionEvent {
    LocalDescription { sdp_type: String, sdp: String },
    LocalCandidate { candidate: String, mid: String },
    StateChanged(ConnectionState),
    ChannelReceived(Box<RtcDataChannel<DcHandler>>),
    ChannelOpen,
}

/// ICE server list for a new peer connection: Google STUN plus the
/// current TURN credential when one is available.
pub(crate) fn ice_servers(turn: Option<&TurnCredentials>) -> Vec<String> {
    let mut servers = vec![STUN_SERVER.to_string()];
    if let Some(creds) = turn {
        for url in &creds.urls {
            // libdatachannel embeds credentials in the URL:
            // turn:user:pass@host:port
            if let Some(rest) = url.strip_prefix("turn:") {
                servers.push(format!("turn:{}:{}@{rest}", creds.username, creds.password));
            } else if let Some(rest) = url.strip_prefix("turns:") {
                servers.push(format!("turns:{}:{}@{rest}", creds.username, creds.password));
            }
        }
    }
    servers
}

pub(crate) struct PcHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
    bind: Arc<WrtcBind>,
}

impl PeerConnectionHandler for PcHandler {
    type DCH = DcHandler;

    fn data_channel_handler(&mut self, _info: DataChannelInfo) -> Self::DCH {
        DcHandler {
            events: self.events.clone(),
            bind: self.bind.clone(),
        }
    }

    fn on_description(&mut self, desc: SessionDescription) {
        let sdp_type = match desc.sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        let _ = self.events.send(SessionEvent::LocalDescription {
            sdp_type: sdp_type.to_string(),
            sdp: desc.sdp.to_string(),
        });
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        let _ = self.events.send(SessionEvent::LocalCandidate {
            candidate: candidate.candidate,
            mid: candidate.mid,
        });
    }

    fn on_connection_state_change(&mut self, state: ConnectionState) {
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    fn on_gathering_state_change(&mut self, _state: GatheringState) {}

    fn on_data_channel(&mut self, dc: Box<RtcDataChannel<Self::DCH>>) {
        let _ = self.events.send(SessionEvent::ChannelReceived(dc));
    }
}

pub(crate) struct DcHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
    bind: Arc<WrtcBind>,
}

impl DataChannelHandler for DcHandler {
    fn on_open(&mut self) {
        let _ = self.events.send(SessionEvent::ChannelOpen);
    }

    fn on_closed(&mut self) {
        debug!("data channel closed");
        self.bind.channel_closed();
    }

    fn on_error(&mut self, err: &str) {
        warn!(error = err, "data channel error");
    }

    fn on_message(&mut self, msg: &[u8]) {
        self.bind.push_datagram(msg);
    }

    fn on_buffered_amount_low(&mut self) {}

    fn on_available(&mut self) {}
}

/// Live session state for one peer.
pub(crate) struct PeerSession {
    pub peer_id: String,
    /// Taken (and thereby closed) on teardown; callbacks stop firing
    /// once the connection is dropped.
    pc: Mutex<Option<Box<RtcPeerConnection<PcHandler>>>>,
    pub bind: Arc<WrtcBind>,
    state: Mutex<ConnectionState>,
    pub wg: tokio::sync::Mutex<Option<WgTunnel>>,
    tun_name: Mutex<Option<String>>,
    /// Parents the WireGuard pump tasks of this session.
    pub cancel: CancellationToken,
}

impl PeerSession {
    /// Create the answerer-side peer connection and the event stream the
    /// coordinator pump consumes.
    pub fn new(
        peer_id: &str,
        turn: Option<&TurnCredentials>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>), TunnelError> {
        let bind = Arc::new(WrtcBind::new());
        let (events, events_rx) = mpsc::unbounded_channel();

        let servers = ice_servers(turn);
        let server_refs: Vec<&str> = servers.iter().map(String::as_str).collect();
        let config = RtcConfig::new(&server_refs);

        let handler = PcHandler {
            events,
            bind: bind.clone(),
        };
        let pc = RtcPeerConnection::new(&config, handler)
            .map_err(|err| TunnelError::WebRtc(err.to_string()))?;

        Ok((
            Arc::new(Self {
                peer_id: peer_id.to_string(),
                pc: Mutex::new(Some(pc)),
                bind,
                state: Mutex::new(ConnectionState::New),
                wg: tokio::sync::Mutex::new(None),
                tun_name: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            events_rx,
        ))
    }

    /// Apply the peer's offer; libdatachannel generates the answer and
    /// hands it back through `on_description`.
    pub fn set_remote_offer(&self, sdp: &str) -> Result<(), TunnelError> {
        self.set_remote_description(sdp, SdpType::Offer)
    }

    pub fn set_remote_answer(&self, sdp: &str) -> Result<(), TunnelError> {
        self.set_remote_description(sdp, SdpType::Answer)
    }

    fn set_remote_description(&self, sdp: &str, sdp_type: SdpType) -> Result<(), TunnelError> {
        let parsed = webrtc_sdp::parse_sdp(sdp, false)
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid SDP: {err:?}")))?;
        let desc = SessionDescription {
            sdp_type,
            sdp: parsed,
        };
        let mut pc = self.pc.lock().expect("peer connection lock poisoned");
        pc.as_mut()
            .ok_or_else(|| TunnelError::PeerNotConnected(self.peer_id.clone()))?
            .set_remote_description(&desc)
            .map_err(|err| TunnelError::WebRtc(err.to_string()))
    }

    pub fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<(), TunnelError> {
        let candidate = IceCandidate {
            candidate: candidate.to_string(),
            mid: mid.to_string(),
        };
        let mut pc = self.pc.lock().expect("peer connection lock poisoned");
        pc.as_mut()
            .ok_or_else(|| TunnelError::PeerNotConnected(self.peer_id.clone()))?
            .add_remote_candidate(&candidate)
            .map_err(|err| TunnelError::WebRtc(err.to_string()))
    }

    pub fn state(&self) -> ConnectionState {
        match *self.state.lock().expect("state lock poisoned") {
            ConnectionState::New => ConnectionState::New,
            ConnectionState::Connecting => ConnectionState::Connecting,
            ConnectionState::Connected => ConnectionState::Connected,
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::Failed => ConnectionState::Failed,
            ConnectionState::Closed => ConnectionState::Closed,
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn set_tun_name(&self, name: &str) {
        *self.tun_name.lock().expect("tun name lock poisoned") = Some(name.to_string());
    }

    pub fn tun_name(&self) -> Option<String> {
        self.tun_name.lock().expect("tun name lock poisoned").clone()
    }

    /// Tear down in dependency order: bind first (stops outbound), then
    /// the peer connection, then the WireGuard pumps. The TUN device is
    /// owned by the pumps and closes with them; the caller removes the
    /// kernel link afterwards.
    pub async fn close(&self) {
        self.bind.close();
        // Dropping the connection closes it and stops its callbacks,
        // which also ends the event pump once the channel drains.
        let pc = self.pc.lock().expect("peer connection lock poisoned").take();
        drop(pc);
        self.cancel.cancel();
        if let Some(wg) = self.wg.lock().await.take() {
            wg.stop().await;
        }
        debug!(peer = %self.peer_id, "peer session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_without_turn_is_stun_only() {
        let servers = ice_servers(None);
        assert_eq!(servers, vec![STUN_SERVER.to_string()]);
    }

    #[test]
    fn ice_servers_embed_turn_credentials() {
        let creds = TurnCredentials {
            username: "alice".into(),
            password: "s3cret".into(),
            ttl: 86400,
            urls: vec![
                "turn:relay.example.com:3478".into(),
                "turns:relay.example.com:5349".into(),
                "stun:ignored.example.com:3478".into(),
            ],
        };
        let servers = ice_servers(Some(&creds));
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[1], "turn:alice:s3cret@relay.example.com:3478");
        assert_eq!(servers[2], "turns:alice:s3cret@relay.example.com:5349");
    }
}
