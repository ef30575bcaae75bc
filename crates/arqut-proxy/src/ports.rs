//! Tunnel port allocation.

use std::collections::HashSet;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::ProxyError;

pub const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 9000);

/// Walks a configured range and returns the first port that is neither
/// recorded in the catalog nor currently bindable-blocked on the host.
///
/// Callers must serialize allocation against the matching catalog insert;
/// the service manager holds its allocation mutex across both.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE.0,
            end: DEFAULT_PORT_RANGE.1,
        }
    }
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub async fn allocate(&self, used: &[u16]) -> Result<u16, ProxyError> {
        let used: HashSet<u16> = used.iter().copied().collect();

        for port in self.start..=self.end {
            if used.contains(&port) {
                continue;
            }
            // Short-lived probe: the listener is dropped immediately.
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    drop(listener);
                    debug!(port, "allocated tunnel port");
                    return Ok(port);
                }
                Err(_) => continue,
            }
        }

        Err(ProxyError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }
}
