//! Reachability endpoint: `GET :3031/` answers `{"status":"pong"}`.
//!
//! Non-critical. The manager logs a bind failure and keeps going.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub(crate) const PING_PORT: u16 = 3031;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct PingServer {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

pub(crate) async fn start(port: u16, parent: &CancellationToken) -> std::io::Result<PingServer> {
    let tcp = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ping service listening");

    let cancel = parent.child_token();
    let tracker = TaskTracker::new();

    let accept_task = {
        let cancel = cancel.clone();
        let tracker = tracker.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = tcp.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { continue };
                tracker.spawn(async move {
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(pong));
                    if let Err(err) = conn.await {
                        debug!(error = %err, "ping connection error");
                    }
                });
            }
        })
    };

    Ok(PingServer {
        cancel,
        tracker,
        accept_task,
    })
}

async fn pong(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(br#"{"status":"pong"}"#)))
        .unwrap_or_default();
    Ok(response)
}

impl PingServer {
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        if timeout(STOP_TIMEOUT, self.tracker.wait()).await.is_err() {
            warn!("ping service shutdown timed out");
        }
        self.accept_task.abort();
        debug!("ping service stopped");
    }
}
