//! Peer table and tunnel addressing.
//!
//! Each live peer owns one index in `[0, 255)`; the point-to-point
//! addresses are derived from it and nothing else: the edge side is
//! `10.0.<index>.1`, the client side `10.0.<index>.2`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use arqut_proto::PeerConfig;

pub(crate) const MAX_PEER_INDEX: u16 = 255;

pub(crate) fn edge_ip(index: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, index, 1)
}

pub(crate) fn client_ip(index: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, index, 2)
}

/// A registered peer and its assigned addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub index: u8,
    pub public_key: String,
    pub edge_ip: String,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTable {
    /// Register a peer from a `connect-request`. A known peer id keeps
    /// its previously assigned index and addressing; a new one gets the
    /// smallest free index.
    pub fn register(&mut self, config: &PeerConfig) -> Result<PeerInfo, TunnelError> {
        let id = config
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TunnelError::PeerProtocol("connect request without peer id".into()))?;

        let public_key = config.public_key.clone().unwrap_or_default();

        if let Some(existing) = self.peers.get_mut(&id) {
            if !public_key.is_empty() {
                existing.public_key = public_key;
            }
            if config.account_id.is_some() {
                existing.account_id = config.account_id.clone();
            }
            return Ok(existing.clone());
        }

        let index = self.allocate_index()?;
        let info = PeerInfo {
            id: id.clone(),
            index,
            public_key,
            edge_ip: edge_ip(index).to_string(),
            client_ip: client_ip(index).to_string(),
            account_id: config.account_id.clone(),
        };
        self.peers.insert(id, info.clone());
        Ok(info)
    }

    fn allocate_index(&self) -> Result<u8, TunnelError> {
        let used: std::collections::HashSet<u8> =
            self.peers.values().map(|p| p.index).collect();
        (0..MAX_PEER_INDEX)
            .map(|i| i as u8)
            .find(|i| !used.contains(i))
            .ok_or(TunnelError::IndexExhausted)
    }

    pub fn get(&self, id: &str) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerInfo> {
        self.peers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> PeerConfig {
        PeerConfig {
            id: Some(id.to_string()),
            public_key: Some(format!("pk-{id}")),
            ..Default::default()
        }
    }

    #[test]
    fn first_peer_gets_index_zero_and_derived_ips() {
        let mut table = PeerTable::default();
        let info = table.register(&request("p1")).unwrap();
        assert_eq!(info.index, 0);
        assert_eq!(info.edge_ip, "10.0.0.1");
        assert_eq!(info.client_ip, "10.0.0.2");
    }

    #[test]
    fn indices_are_smallest_free() {
        let mut table = PeerTable::default();
        table.register(&request("p0")).unwrap();
        table.register(&request("p1")).unwrap();
        table.register(&request("p2")).unwrap();
        table.remove("p1");

        let info = table.register(&request("p3")).unwrap();
        assert_eq!(info.index, 1);
    }

    #[test]
    fn reconnecting_peer_keeps_its_addressing() {
        let mut table = PeerTable::default();
        let first = table.register(&request("p0")).unwrap();
        table.register(&request("p1")).unwrap();

        let again = table.register(&request("p0")).unwrap();
        assert_eq!(again.index, first.index);
        assert_eq!(again.edge_ip, first.edge_ip);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn exhausted_index_space_is_an_error() {
        let mut table = PeerTable::default();
        for i in 0..MAX_PEER_INDEX {
            table.register(&request(&format!("p{i}"))).unwrap();
        }
        let err = table.register(&request("overflow")).unwrap_err();
        assert!(matches!(err, TunnelError::IndexExhausted));
    }

    #[test]
    fn register_requires_a_peer_id() {
        let mut table = PeerTable::default();
        let err = table.register(&PeerConfig::default()).unwrap_err();
        assert!(matches!(err, TunnelError::PeerProtocol(_)));
    }
}
