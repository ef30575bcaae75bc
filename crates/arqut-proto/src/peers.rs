//! Peer registration, TURN and SDP/ICE payloads.

use serde::{Deserialize, Serialize};

/// Partial peer description carried by `connect-request`.
///
/// Clients send whatever subset they know; absent fields are filled in by
/// the edge (index and tunnel addressing in particular).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub peer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

/// `connect-response` payload: the edge's side of a peer registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub index: u8,
    pub id: String,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub public_key: String,
    pub edge_ip: String,
    pub client_ip: String,
}

/// `turn-response` payload: relay credentials issued by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl: u64,
    pub urls: Vec<String>,
}

/// `offer` / `answer` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,
    pub sdp: String,
}

/// `ice-candidate` payload. Field names follow the browser's
/// `RTCIceCandidateInit` casing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}
