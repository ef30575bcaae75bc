//! Wire protocol for the cloud signaling channel.
//!
//! Every frame on the signaling WebSocket is a [`SignalMessage`]: a typed
//! envelope whose `data` field stays raw JSON until the handler registered
//! for that type parses it. The payload structs for the built-in message
//! types live in [`messages`] (service catalog sync) and [`peers`]
//! (peer registration, TURN, SDP/ICE).

pub mod messages;
pub mod peers;

use serde::{Deserialize, Serialize};

pub use messages::{
    AckStatus, BatchOperation, Protocol, ServiceRecord, ServiceSync, ServiceSyncAck,
    ServiceSyncBatch, SyncOperation,
};
pub use peers::{ConnectResponse, IceCandidatePayload, PeerConfig, SdpPayload, TurnCredentials};

/// Message type identifiers used on the signaling channel.
pub mod msg_type {
    pub const SERVICE_SYNC: &str = "service-sync";
    pub const SERVICE_SYNC_BATCH: &str = "service-sync-batch";
    pub const SERVICE_SYNC_ACK: &str = "service-sync-ack";

    pub const TURN_REQUEST: &str = "turn-request";
    pub const TURN_RESPONSE: &str = "turn-response";

    pub const CONNECT_REQUEST: &str = "connect-request";
    pub const CONNECT_RESPONSE: &str = "connect-response";
    pub const API_CONNECT_REQUEST: &str = "api-connect-request";
    pub const API_CONNECT_RESPONSE: &str = "api-connect-response";

    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
}

/// Envelope for every frame exchanged with the cloud.
///
/// `data` is kept as raw JSON; only the handler registered for `kind`
/// knows its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl SignalMessage {
    /// Build an envelope around a serializable payload.
    pub fn new<T: Serialize>(
        kind: &str,
        from: Option<String>,
        to: Option<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            from,
            to,
            data: serde_json::to_value(data)?,
        })
    }

    /// Parse the payload as the type the caller expects for this kind.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_absent_routing_fields() {
        let msg = SignalMessage::new("turn-request", None, None, &json!({})).unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire, json!({ "type": "turn-request", "data": {} }));
    }

    #[test]
    fn envelope_keeps_routing_fields() {
        let msg = SignalMessage {
            kind: "answer".into(),
            from: Some("edge-1".into()),
            to: Some("peer-1".into()),
            data: json!({ "sdp": "v=0" }),
        };
        let wire = serde_json::to_string(&msg).unwrap();
        let back: SignalMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.from.as_deref(), Some("edge-1"));
        assert_eq!(back.to.as_deref(), Some("peer-1"));
    }

    #[test]
    fn data_defaults_to_null_when_missing() {
        let back: SignalMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(back.kind, "ping");
        assert!(back.data.is_null());
    }
}
