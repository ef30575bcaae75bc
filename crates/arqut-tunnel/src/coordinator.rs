//! The tunnel coordinator: peer registration, WebRTC negotiation and
//! WireGuard bring-up, driven entirely by signaling messages.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use datachannel::ConnectionState;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arqut_proto::{
    msg_type, ConnectResponse, IceCandidatePayload, PeerConfig, SdpPayload, SignalMessage,
    TurnCredentials,
};
use arqut_signaling::{HandlerError, SignalingClient};

use crate::error::TunnelError;
use crate::netdev;
use crate::peers::{self, PeerInfo, PeerTable};
use crate::session::{PeerSession, SessionEvent, WIREGUARD_CHANNEL};
use crate::wg::{self, EdgeKeys};
use crate::InterfaceSink;

/// How long the data channel settles before WireGuard comes up.
const CHANNEL_SETTLE: Duration = Duration::from_millis(200);
/// TURN credentials are also refreshed on every signaling reconnect.
const TURN_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Coordinates every peer tunnel. Cheap to clone.
#[derive(Clone)]
pub struct TunnelCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    edge_id: String,
    keys: EdgeKeys,
    client: SignalingClient,
    peers: Mutex<PeerTable>,
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
    turn: StdMutex<Option<TurnCredentials>>,
    sink: RwLock<Option<Arc<dyn InterfaceSink>>>,
    cancel: CancellationToken,
}

impl TunnelCoordinator {
    /// Sweeps stale tunnel interfaces from previous runs and generates
    /// this edge's static key pair.
    pub async fn new(edge_id: &str, client: SignalingClient) -> Self {
        netdev::sweep_stale_links().await;

        let coordinator = Self {
            inner: Arc::new(Inner {
                edge_id: edge_id.to_string(),
                keys: EdgeKeys::generate(),
                client,
                peers: Mutex::new(PeerTable::default()),
                sessions: Mutex::new(HashMap::new()),
                turn: StdMutex::new(None),
                sink: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
        };

        // Periodic TURN refresh, in addition to the on-connect fetch.
        let inner = coordinator.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TURN_REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = interval.tick() => inner.request_turn().await,
                }
            }
        });

        coordinator
    }

    /// Base64 public key announced to peers.
    pub fn public_key(&self) -> String {
        self.inner.keys.public_base64()
    }

    /// Install all signaling handlers and the on-connect TURN fetch.
    pub fn register(&self) {
        let client = &self.inner.client;

        for (kind, response) in [
            (msg_type::CONNECT_REQUEST, msg_type::CONNECT_RESPONSE),
            (msg_type::API_CONNECT_REQUEST, msg_type::API_CONNECT_RESPONSE),
        ] {
            let this = self.clone();
            client.register_handler(kind, move |msg| {
                let this = this.clone();
                async move { to_handler_result(this.handle_connect_request(msg, response).await) }
            });
        }

        let this = self.clone();
        client.register_handler(msg_type::OFFER, move |msg| {
            let this = this.clone();
            async move { to_handler_result(this.handle_offer(msg).await) }
        });

        let this = self.clone();
        client.register_handler(msg_type::ANSWER, move |msg| {
            let this = this.clone();
            async move { to_handler_result(this.handle_answer(msg).await) }
        });

        let this = self.clone();
        client.register_handler(msg_type::ICE_CANDIDATE, move |msg| {
            let this = this.clone();
            async move { to_handler_result(this.handle_ice_candidate(msg).await) }
        });

        let this = self.clone();
        client.register_handler(msg_type::TURN_RESPONSE, move |msg| {
            let this = this.clone();
            async move { to_handler_result(this.handle_turn_response(msg)) }
        });

        let this = self.clone();
        client.add_on_connect(move || {
            let this = this.clone();
            async move {
                this.inner.request_turn().await;
                Ok(())
            }
        });
    }

    /// Wire the interface sink and push the current snapshot into it.
    pub async fn set_interface_sink(&self, sink: Arc<dyn InterfaceSink>) {
        let snapshot = self.interface_ips().await;
        sink.set_interface_ips(snapshot).await;
        *self.inner.sink.write().await = Some(sink);
    }

    /// Peers with a live WebRTC session.
    pub async fn connected_peers(&self) -> Vec<String> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.peers.lock().await.get(peer_id).cloned()
    }

    /// Tunnel interface name to edge-side address, for every session with
    /// a device up.
    pub async fn interface_ips(&self) -> HashMap<String, String> {
        let sessions = self.inner.sessions.lock().await;
        let peers = self.inner.peers.lock().await;

        let mut result = HashMap::new();
        for (peer_id, session) in sessions.iter() {
            if let (Some(name), Some(peer)) = (session.tun_name(), peers.get(peer_id)) {
                result.insert(name, peer.edge_ip.clone());
            }
        }
        result
    }

    /// API-initiated disconnect.
    pub async fn disconnect_peer(&self, peer_id: &str) -> Result<(), TunnelError> {
        if !self.inner.sessions.lock().await.contains_key(peer_id) {
            return Err(TunnelError::PeerNotConnected(peer_id.to_string()));
        }
        self.inner.close_peer(peer_id).await;
        Ok(())
    }

    /// Tear down every session.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            info!(peer = %id, "closing peer session");
            self.inner.close_session(&id).await;
        }
        info!("tunnel coordinator stopped");
    }

    async fn handle_connect_request(
        &self,
        msg: SignalMessage,
        response_kind: &str,
    ) -> Result<(), TunnelError> {
        let config: PeerConfig = msg
            .parse_data()
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid connect request: {err}")))?;

        let (info, was_known, total) = {
            let mut peers = self.inner.peers.lock().await;
            let was_known = config
                .id
                .as_deref()
                .map(|id| peers.get(id).is_some())
                .unwrap_or(false);
            let info = peers.register(&config)?;
            (info, was_known, peers.len())
        };

        // A re-registering client has lost track of its session; drop
        // ours so the coming offer starts clean.
        if was_known {
            self.inner.close_session(&info.id).await;
        }

        let response = ConnectResponse {
            index: info.index,
            id: self.inner.edge_id.clone(),
            peer_type: "edge".to_string(),
            public_key: self.inner.keys.public_base64(),
            edge_ip: info.edge_ip.clone(),
            client_ip: info.client_ip.clone(),
        };
        self.inner
            .client
            .send(
                response_kind,
                Some(self.inner.edge_id.clone()),
                Some(info.id.clone()),
                &response,
            )
            .await?;

        info!(peer = %info.id, index = info.index, peers = total, "peer registered");
        Ok(())
    }

    async fn handle_offer(&self, msg: SignalMessage) -> Result<(), TunnelError> {
        let from = sender_of(&msg)?;

        if let Some(existing) = self.inner.sessions.lock().await.get(&from) {
            if existing.state() == ConnectionState::Connected {
                info!(peer = %from, "already connected, ignoring offer");
                return Ok(());
            }
        }
        self.inner.close_session(&from).await;

        if self.inner.peers.lock().await.get(&from).is_none() {
            return Err(TunnelError::UnknownPeer(from));
        }

        let payload: SdpPayload = msg
            .parse_data()
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid offer: {err}")))?;

        let turn = self
            .inner
            .turn
            .lock()
            .expect("turn lock poisoned")
            .clone();
        let (session, events) = PeerSession::new(&from, turn.as_ref())?;

        tokio::spawn(session_pump(
            self.inner.clone(),
            from.clone(),
            session.clone(),
            events,
        ));
        self.inner
            .sessions
            .lock()
            .await
            .insert(from.clone(), session.clone());

        // libdatachannel generates the answer and hands it to the pump.
        session.set_remote_offer(&payload.sdp)?;
        info!(peer = %from, "offer accepted");
        Ok(())
    }

    async fn handle_answer(&self, msg: SignalMessage) -> Result<(), TunnelError> {
        let from = sender_of(&msg)?;
        let session = self
            .inner
            .session(&from)
            .await
            .ok_or_else(|| TunnelError::PeerNotConnected(from.clone()))?;

        let payload: SdpPayload = msg
            .parse_data()
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid answer: {err}")))?;
        session.set_remote_answer(&payload.sdp)
    }

    async fn handle_ice_candidate(&self, msg: SignalMessage) -> Result<(), TunnelError> {
        let from = sender_of(&msg)?;
        let session = self
            .inner
            .session(&from)
            .await
            .ok_or_else(|| TunnelError::PeerNotConnected(from.clone()))?;

        let payload: IceCandidatePayload = msg
            .parse_data()
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid ICE candidate: {err}")))?;
        session.add_remote_candidate(&payload.candidate, payload.sdp_mid.as_deref().unwrap_or("0"))
    }

    fn handle_turn_response(&self, msg: SignalMessage) -> Result<(), TunnelError> {
        let creds: TurnCredentials = msg
            .parse_data()
            .map_err(|err| TunnelError::PeerProtocol(format!("invalid TURN response: {err}")))?;
        info!(urls = creds.urls.len(), ttl = creds.ttl, "received TURN credentials");
        *self.inner.turn.lock().expect("turn lock poisoned") = Some(creds);
        Ok(())
    }
}

impl Inner {
    async fn session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.get(peer_id).cloned()
    }

    async fn request_turn(&self) {
        if let Err(err) = self
            .client
            .send(
                msg_type::TURN_REQUEST,
                Some(self.edge_id.clone()),
                None,
                &serde_json::json!({}),
            )
            .await
        {
            warn!(error = %err, "failed to request TURN credentials");
        }
    }

    /// Tear down a session but keep the peer's table entry (used when a
    /// known peer re-registers).
    async fn close_session(&self, peer_id: &str) {
        let session = self.sessions.lock().await.remove(peer_id);
        let Some(session) = session else { return };

        let tun_name = session.tun_name();
        session.close().await;

        if let Some(name) = tun_name {
            netdev::spawn_link_cleanup(name.clone());
            if let Some(sink) = self.sink.read().await.clone() {
                sink.remove_interface(&name).await;
            }
        }
    }

    /// Full peer teardown: session plus table entry.
    async fn close_peer(&self, peer_id: &str) {
        self.close_session(peer_id).await;
        if self.peers.lock().await.remove(peer_id).is_some() {
            info!(peer = %peer_id, "peer disconnected");
        }
    }

    /// Create the TUN device and WireGuard pumps after the data channel
    /// settled, then publish the interface.
    async fn bring_up_wireguard(
        self: &Arc<Self>,
        peer_id: &str,
        session: &Arc<PeerSession>,
    ) -> Result<(), TunnelError> {
        let peer = self
            .peers
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| TunnelError::UnknownPeer(peer_id.to_string()))?;
        let peer_public = wg::parse_public_key(&peer.public_key)?;

        let edge_ip: Ipv4Addr = peers::edge_ip(peer.index);
        let client_ip: Ipv4Addr = peers::client_ip(peer.index);
        let tun_name = netdev::tun_name_for_peer(peer_id);

        let device = netdev::create_tun(&tun_name, edge_ip).await?;

        let wg = match wg::spawn(
            &self.keys,
            peer_public,
            session.bind.clone(),
            device,
            client_ip,
            session.cancel.child_token(),
        ) {
            Ok(wg) => wg,
            Err(err) => {
                netdev::spawn_link_cleanup(tun_name);
                return Err(err);
            }
        };

        *session.wg.lock().await = Some(wg);
        session.set_tun_name(&tun_name);

        // Only announce while the session is still healthy.
        if session.state() == ConnectionState::Connected && session.bind.is_open() {
            if let Some(sink) = self.sink.read().await.clone() {
                sink.add_interface(&tun_name, &edge_ip.to_string()).await;
            }
            info!(peer = %peer_id, tun = %tun_name, "tunnel interface ready");
        }
        Ok(())
    }
}

/// Consumes one session's WebRTC events until its channel closes.
async fn session_pump(
    inner: Arc<Inner>,
    peer_id: String,
    session: Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::LocalDescription { sdp_type, sdp } => {
                let payload = SdpPayload {
                    sdp_type: Some(sdp_type),
                    sdp,
                };
                if let Err(err) = inner
                    .client
                    .send(
                        msg_type::ANSWER,
                        Some(inner.edge_id.clone()),
                        Some(peer_id.clone()),
                        &payload,
                    )
                    .await
                {
                    warn!(peer = %peer_id, error = %err, "failed to send answer");
                } else {
                    info!(peer = %peer_id, "sent answer");
                }
            }
            SessionEvent::LocalCandidate { candidate, mid } => {
                let payload = IceCandidatePayload {
                    candidate,
                    sdp_mid: Some(mid),
                    sdp_mline_index: None,
                };
                if let Err(err) = inner
                    .client
                    .send(
                        msg_type::ICE_CANDIDATE,
                        Some(inner.edge_id.clone()),
                        Some(peer_id.clone()),
                        &payload,
                    )
                    .await
                {
                    warn!(peer = %peer_id, error = %err, "failed to send ICE candidate");
                }
            }
            SessionEvent::StateChanged(state) => {
                info!(peer = %peer_id, ?state, "connection state changed");
                let terminal = matches!(
                    state,
                    ConnectionState::Closed | ConnectionState::Disconnected | ConnectionState::Failed
                );
                session.set_state(state);
                if terminal {
                    // Stop traffic first so WireGuard cannot write to
                    // a dead channel, then drop the peer.
                    session.bind.close();
                    inner.close_peer(&peer_id).await;
                    return;
                }
            }
            SessionEvent::ChannelReceived(dc) => {
                if dc.label() == WIREGUARD_CHANNEL {
                    debug!(peer = %peer_id, "wireguard data channel received");
                    session.bind.set_data_channel(dc);
                } else {
                    warn!(peer = %peer_id, label = %dc.label(), "unexpected data channel, dropping");
                }
            }
            SessionEvent::ChannelOpen => {
                session.bind.mark_open();
                let inner = inner.clone();
                let session = session.clone();
                let peer_id = peer_id.clone();
                tokio::spawn(async move {
                    sleep(CHANNEL_SETTLE).await;
                    if session.state() != ConnectionState::Connected || !session.bind.is_open() {
                        debug!(peer = %peer_id, "session gone before WireGuard bring-up");
                        return;
                    }
                    if session.wg.lock().await.is_some() {
                        return;
                    }
                    if let Err(err) = inner.bring_up_wireguard(&peer_id, &session).await {
                        error!(peer = %peer_id, error = %err, "WireGuard bring-up failed");
                    }
                });
            }
        }
    }
    debug!(peer = %peer_id, "session event pump ended");
}

fn sender_of(msg: &SignalMessage) -> Result<String, TunnelError> {
    msg.from
        .clone()
        .filter(|from| !from.is_empty())
        .ok_or_else(|| TunnelError::PeerProtocol(format!("{} without sender", msg.kind)))
}

fn to_handler_result(result: Result<(), TunnelError>) -> Result<(), HandlerError> {
    result.map_err(|err| Box::new(err) as HandlerError)
}
