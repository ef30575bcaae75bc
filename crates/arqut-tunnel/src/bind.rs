//! The WireGuard ↔ data-channel bridge.
//!
//! WireGuard treats the WebRTC data channel as a point-to-point datagram
//! link. Inbound channel messages land in a bounded queue drained by the
//! tunnel's receive pump; outbound handshake and transport packets are
//! written straight to the channel.

use std::sync::Mutex;
use std::time::Duration;

use datachannel::RtcDataChannel;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::session::DcHandler;

/// Queue depth for inbound datagrams. Overflow drops the packet; the
/// peers' retransmit timers absorb occasional loss.
const RECV_QUEUE: usize = 100;

/// How long a receive blocks before yielding with no datagram.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct WrtcBind {
    inner: Mutex<BindInner>,
}

struct BindInner {
    dc: Option<Box<RtcDataChannel<DcHandler>>>,
    dc_open: bool,
    closed: bool,
    recv_tx: mpsc::Sender<Vec<u8>>,
    recv_rx: Option<mpsc::Receiver<Vec<u8>>>,
    close_token: CancellationToken,
}

/// Receive side handed out by [`WrtcBind::open`]; owned by the tunnel's
/// inbound pump.
pub(crate) struct BindReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    close_token: CancellationToken,
}

impl WrtcBind {
    pub fn new() -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);
        Self {
            inner: Mutex::new(BindInner {
                dc: None,
                dc_open: false,
                closed: false,
                recv_tx,
                recv_rx: Some(recv_rx),
                close_token: CancellationToken::new(),
            }),
        }
    }

    /// Take the receive side. Re-opening a closed bind re-initializes
    /// its queue and close signal.
    pub fn open(&self) -> Result<BindReceiver, TunnelError> {
        let mut inner = self.lock();
        if inner.closed {
            let (tx, rx) = mpsc::channel(RECV_QUEUE);
            inner.recv_tx = tx;
            inner.recv_rx = Some(rx);
            inner.close_token = CancellationToken::new();
            inner.closed = false;
        }
        let rx = inner
            .recv_rx
            .take()
            .ok_or_else(|| TunnelError::WireGuard("bind already open".into()))?;
        Ok(BindReceiver {
            rx,
            close_token: inner.close_token.clone(),
        })
    }

    /// Adopt the peer's data channel once it arrives.
    pub fn set_data_channel(&self, dc: Box<RtcDataChannel<DcHandler>>) {
        let mut inner = self.lock();
        inner.dc = Some(dc);
    }

    /// Channel open callback fired.
    pub fn mark_open(&self) {
        self.lock().dc_open = true;
    }

    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        !inner.closed && inner.dc.is_some() && inner.dc_open
    }

    /// Data channel closed underneath us: stop handing out datagrams.
    pub fn channel_closed(&self) {
        let mut inner = self.lock();
        inner.dc = None;
        inner.dc_open = false;
        if !inner.closed {
            inner.closed = true;
            inner.close_token.cancel();
        }
    }

    /// Inbound datagram from the data channel callback. Non-blocking: a
    /// full queue drops the packet with a log line.
    pub fn push_datagram(&self, data: &[u8]) {
        let inner = self.lock();
        if inner.closed {
            return;
        }
        if inner.recv_tx.try_send(data.to_vec()).is_err() {
            warn!(len = data.len(), "bind receive queue full, dropping packet");
        }
    }

    /// Write one datagram to the data channel. Empty buffers are
    /// skipped; a closed bind or a non-open channel is an error.
    pub fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut inner = self.lock();
        if inner.closed || !inner.dc_open {
            return Err(TunnelError::BindClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let Some(dc) = inner.dc.as_mut() else {
            return Err(TunnelError::BindClosed);
        };
        dc.send(data)
            .map_err(|err| TunnelError::WebRtc(err.to_string()))
    }

    /// Stop outbound traffic and wake the receive pump.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.close_token.cancel();
        debug!("bind closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BindInner> {
        self.inner.lock().expect("bind lock poisoned")
    }
}

impl BindReceiver {
    /// Wait up to [`RECV_TIMEOUT`] for a datagram.
    ///
    /// `Ok(None)` is a timeout (lets the caller tick timers); an error
    /// means the bind is closed. A datagram larger than `max_len` is a
    /// hard error.
    pub async fn recv(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, TunnelError> {
        tokio::select! {
            biased;
            _ = self.close_token.cancelled() => Err(TunnelError::BindClosed),
            datagram = self.rx.recv() => match datagram {
                Some(data) if data.len() > max_len => Err(TunnelError::WireGuard(format!(
                    "datagram too large: {} > {}",
                    data.len(),
                    max_len
                ))),
                Some(data) => Ok(Some(data)),
                None => Err(TunnelError::BindClosed),
            },
            _ = sleep(RECV_TIMEOUT) => Ok(None),
        }
    }
}
