//! Peer tunnel coordinator.
//!
//! For every roaming client the coordinator answers a WebRTC offer,
//! accepts the peer's `"wireguard"` data channel, and runs a userspace
//! WireGuard tunnel whose datagram transport is that channel. The
//! resulting TUN interface is published through [`InterfaceSink`] so the
//! service manager starts binding listeners on it.

mod bind;
mod coordinator;
mod error;
mod netdev;
mod peers;
mod session;
mod wg;

pub use coordinator::TunnelCoordinator;
pub use error::TunnelError;
pub use peers::PeerInfo;

use std::collections::HashMap;

/// One-way feed of tunnel interfaces into the service manager.
///
/// Declared here, on the consumer side, so the coordinator and the
/// service manager stay acyclic: the coordinator pushes, and never asks
/// the manager for anything.
#[async_trait::async_trait]
pub trait InterfaceSink: Send + Sync {
    async fn set_interface_ips(&self, ips: HashMap<String, String>);
    async fn add_interface(&self, name: &str, ip: &str);
    async fn remove_interface(&self, name: &str);
}
