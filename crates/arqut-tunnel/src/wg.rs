//! Userspace WireGuard driven over the WebRTC bind.
//!
//! Three pumps per tunnel: TUN reads are encrypted onto the data
//! channel, channel datagrams are decrypted into the TUN, and a timer
//! tick drives handshakes and keepalives. The
//! noise state machine is boringtun's `Tunn`; the equivalent of a kernel
//! allowed-ips check happens on the decrypt path, where only packets
//! sourced from the peer's tunnel address reach the TUN.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bind::{BindReceiver, WrtcBind};
use crate::error::TunnelError;

/// Room for an MTU-sized packet plus WireGuard framing.
const BUF_SIZE: usize = 1700;
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;
const TIMER_TICK: Duration = Duration::from_millis(250);

/// The edge's static Curve25519 key pair.
#[derive(Clone)]
pub(crate) struct EdgeKeys {
    pub private: StaticSecret,
    pub public: PublicKey,
}

impl EdgeKeys {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let private = StaticSecret::from(bytes);
        let public = PublicKey::from(&private);
        Self { private, public }
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

pub(crate) fn parse_public_key(encoded: &str) -> Result<PublicKey, TunnelError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| TunnelError::WireGuard(format!("invalid public key: {err}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TunnelError::WireGuard("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

/// Handle to a running tunnel's pump tasks.
pub(crate) struct WgTunnel {
    tasks: Vec<JoinHandle<()>>,
}

impl WgTunnel {
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bring up the noise machine and start the pumps. The TUN device moves
/// into the pump tasks and closes when they end.
pub(crate) fn spawn(
    keys: &EdgeKeys,
    peer_public: PublicKey,
    bind: Arc<WrtcBind>,
    device: tun::AsyncDevice,
    client_ip: Ipv4Addr,
    cancel: CancellationToken,
) -> Result<WgTunnel, TunnelError> {
    let tunn = Tunn::new(
        keys.private.clone(),
        peer_public,
        None,
        Some(PERSISTENT_KEEPALIVE_SECS),
        0,
        None,
    )
    .map_err(|err| TunnelError::WireGuard(err.to_string()))?;
    let tunn = Arc::new(Mutex::new(tunn));
    let receiver = bind.open()?;
    let (tun_read, tun_write) = tokio::io::split(device);

    let tasks = vec![
        tokio::spawn(outbound_pump(
            tunn.clone(),
            bind.clone(),
            tun_read,
            cancel.clone(),
        )),
        tokio::spawn(inbound_pump(
            tunn.clone(),
            bind.clone(),
            receiver,
            tun_write,
            client_ip,
            cancel.clone(),
        )),
        tokio::spawn(timer_pump(tunn, bind, cancel)),
    ];

    Ok(WgTunnel { tasks })
}

/// Reads TUN packets, encrypts them, writes to the data channel.
async fn outbound_pump(
    tunn: Arc<Mutex<Tunn>>,
    bind: Arc<WrtcBind>,
    mut tun_read: tokio::io::ReadHalf<tun::AsyncDevice>,
    cancel: CancellationToken,
) {
    let mut packet = vec![0u8; BUF_SIZE];
    let mut out = vec![0u8; BUF_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tun_read.read(&mut packet) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "TUN read ended");
                break;
            }
        };

        let to_send = {
            let mut tunn = tunn.lock().expect("tunn lock poisoned");
            match tunn.encapsulate(&packet[..n], &mut out) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Err(err) => {
                    warn!(error = ?err, "encapsulate failed");
                    None
                }
                _ => None,
            }
        };

        if let Some(data) = to_send {
            if let Err(err) = bind.send(&data) {
                debug!(error = %err, "outbound pump stopping");
                break;
            }
        }
    }
}

/// Decrypts channel datagrams into the TUN, sending handshake replies
/// back out.
async fn inbound_pump(
    tunn: Arc<Mutex<Tunn>>,
    bind: Arc<WrtcBind>,
    mut receiver: BindReceiver,
    mut tun_write: tokio::io::WriteHalf<tun::AsyncDevice>,
    client_ip: Ipv4Addr,
    cancel: CancellationToken,
) {
    let mut out = vec![0u8; BUF_SIZE];

    'outer: loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            result = receiver.recv(BUF_SIZE) => match result {
                Ok(Some(datagram)) => datagram,
                // Timeout: nothing to decrypt, timers tick elsewhere.
                Ok(None) => continue,
                Err(err) => {
                    debug!(error = %err, "inbound pump stopping");
                    break;
                }
            },
        };

        let mut to_net: Vec<Vec<u8>> = Vec::new();
        let mut to_tun: Vec<Vec<u8>> = Vec::new();
        {
            let mut tunn = tunn.lock().expect("tunn lock poisoned");
            let mut first = true;
            loop {
                let result = if first {
                    first = false;
                    tunn.decapsulate(None, &datagram, &mut out)
                } else {
                    // Flush packets queued behind the handshake.
                    tunn.decapsulate(None, &[], &mut out)
                };
                match result {
                    TunnResult::WriteToNetwork(data) => {
                        to_net.push(data.to_vec());
                        continue;
                    }
                    TunnResult::WriteToTunnelV4(data, src) => {
                        // allowed_ips: only the peer's address may enter.
                        if src == client_ip {
                            to_tun.push(data.to_vec());
                        } else {
                            debug!(%src, "dropping packet outside allowed ips");
                        }
                        break;
                    }
                    TunnResult::WriteToTunnelV6(_, src) => {
                        debug!(%src, "dropping IPv6 packet on v4 tunnel");
                        break;
                    }
                    TunnResult::Err(err) => {
                        debug!(error = ?err, "decapsulate failed");
                        break;
                    }
                    TunnResult::Done => break,
                }
            }
        }

        for data in to_net {
            if let Err(err) = bind.send(&data) {
                debug!(error = %err, "inbound pump stopping");
                break 'outer;
            }
        }
        for packet in to_tun {
            if let Err(err) = tun_write.write_all(&packet).await {
                debug!(error = %err, "TUN write failed");
                break 'outer;
            }
        }
    }
}

/// Periodic handshake/keepalive timers.
async fn timer_pump(tunn: Arc<Mutex<Tunn>>, bind: Arc<WrtcBind>, cancel: CancellationToken) {
    let mut out = vec![0u8; BUF_SIZE];
    let mut interval = tokio::time::interval(TIMER_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let to_send = {
            let mut tunn = tunn.lock().expect("tunn lock poisoned");
            match tunn.update_timers(&mut out) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Err(err) => {
                    debug!(error = ?err, "timer update failed");
                    None
                }
                _ => None,
            }
        };

        if let Some(data) = to_send {
            // The bind may legitimately be closed between ticks.
            let _ = bind.send(&data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_round_trips() {
        let keys = EdgeKeys::generate();
        let encoded = keys.public_base64();
        let decoded = parse_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), keys.public.as_bytes());
    }

    #[test]
    fn malformed_public_keys_are_rejected() {
        assert!(parse_public_key("not-base64!!!").is_err());
        assert!(parse_public_key(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn generated_keys_differ() {
        let a = EdgeKeys::generate();
        let b = EdgeKeys::generate();
        assert_ne!(a.public.as_bytes(), b.public.as_bytes());
    }
}
