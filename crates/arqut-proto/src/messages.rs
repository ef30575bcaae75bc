//! Service catalog sync payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol a published service speaks behind the proxy.
///
/// WebSocket services still go through the plain HTTP listener; the
/// distinction only matters for labeling and the cloud catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Websocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Websocket => "websocket",
        }
    }

    /// Strict parse of the canonical spellings.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Protocol::Http),
            "websocket" => Some(Protocol::Websocket),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog row as it appears on the wire and in API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub tunnel_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: Protocol,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Single-service mutation pushed to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Created,
    Updated,
    Deleted,
    Enabled,
    Disabled,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Created => "created",
            SyncOperation::Updated => "updated",
            SyncOperation::Deleted => "deleted",
            SyncOperation::Enabled => "enabled",
            SyncOperation::Disabled => "disabled",
        }
    }
}

/// Bulk catalog operation pushed to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    /// Full snapshot of the current catalog.
    Sync,
    /// The catalog is being emptied; the cloud should drop these rows.
    Remove,
}

/// `service-sync` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSync {
    pub message_id: String,
    pub operation: SyncOperation,
    pub service: ServiceRecord,
}

/// `service-sync-batch` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSyncBatch {
    pub message_id: String,
    pub operation: BatchOperation,
    pub services: Vec<ServiceRecord>,
}

/// Ack status reported by the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// `service-sync-ack` payload, sent by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSyncAck {
    pub message_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ServiceRecord {
        ServiceRecord {
            id: "a1b2c3d4".into(),
            name: "web".into(),
            tunnel_port: 8000,
            local_host: "localhost".into(),
            local_port: 80,
            protocol: Protocol::Http,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sync_operation_spelling() {
        let payload = ServiceSync {
            message_id: "m1".into(),
            operation: SyncOperation::Created,
            service: record(),
        };
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["operation"], json!("created"));
        assert_eq!(wire["service"]["protocol"], json!("http"));
    }

    #[test]
    fn batch_operation_spelling() {
        let payload = ServiceSyncBatch {
            message_id: "m2".into(),
            operation: BatchOperation::Remove,
            services: vec![],
        };
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["operation"], json!("remove"));
    }

    #[test]
    fn ack_tolerates_missing_optionals() {
        let ack: ServiceSyncAck =
            serde_json::from_value(json!({ "message_id": "m3", "status": "error" })).unwrap();
        assert_eq!(ack.status, AckStatus::Error);
        assert!(ack.message.is_none());
        assert!(ack.error.is_none());
    }

    #[test]
    fn protocol_parse_is_strict() {
        assert_eq!(Protocol::parse("http"), Some(Protocol::Http));
        assert_eq!(Protocol::parse("websocket"), Some(Protocol::Websocket));
        assert_eq!(Protocol::parse("ws"), None);
        assert_eq!(Protocol::parse("tcp"), None);
    }
}
