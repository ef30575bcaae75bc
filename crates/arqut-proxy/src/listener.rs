//! One reverse-proxy listener: a bound TCP socket forwarding to a single
//! upstream, with connection pooling and Upgrade (WebSocket) bridging.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderValue, HOST, UPGRADE};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;

/// Budget for one upstream round trip (headers received).
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Reading the request head from a client.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace window before in-flight connections are force-closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MAX_POOL_SIZE: usize = 10;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// What the listener needs to know about its service.
#[derive(Debug, Clone)]
pub(crate) struct ListenerSpec {
    pub service_id: String,
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub tunnel_port: u16,
}

impl ListenerSpec {
    pub fn key(&self, ip: &str) -> String {
        format!("{}-{}:{}", self.service_id, ip, self.tunnel_port)
    }
}

/// Handle to a running listener. Dropping it does not stop the listener;
/// call [`ListenerHandle::stop`].
pub(crate) struct ListenerHandle {
    pub service_id: String,
    pub bind_addr: SocketAddr,
    cancel: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop accepting, give in-flight connections a grace window, then
    /// force-close stragglers.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        if timeout(SHUTDOWN_GRACE, self.tracker.wait()).await.is_err() {
            warn!(addr = %self.bind_addr, "graceful shutdown timed out, force closing connections");
            self.force.cancel();
            let _ = timeout(Duration::from_secs(1), self.tracker.wait()).await;
        }
        self.accept_task.abort();
        debug!(addr = %self.bind_addr, service = %self.service_id, "listener stopped");
    }
}

/// Bind `ip:tunnel_port` and start serving.
pub(crate) async fn spawn_listener(
    spec: ListenerSpec,
    ip: &str,
    parent: &CancellationToken,
) -> Result<ListenerHandle, ProxyError> {
    let addr: SocketAddr = format!("{}:{}", ip, spec.tunnel_port)
        .parse()
        .map_err(|_| ProxyError::InvalidAddr(format!("{}:{}", ip, spec.tunnel_port)))?;

    let tcp = TcpListener::bind(addr).await?;
    let bind_addr = tcp.local_addr()?;

    let upstream = Arc::new(Upstream {
        authority: format!("{}:{}", spec.local_host, spec.local_port),
        pool: Mutex::new(Vec::new()),
    });

    info!(
        service = %spec.name,
        addr = %bind_addr,
        upstream = %upstream.authority,
        "starting reverse proxy listener"
    );

    let cancel = parent.child_token();
    let force = CancellationToken::new();
    let tracker = TaskTracker::new();
    let service_id = spec.service_id.clone();

    let accept_task = {
        let cancel = cancel.clone();
        let force = force.clone();
        let tracker = tracker.clone();
        let name = spec.name.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = tcp.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(service = %name, error = %err, "accept failed");
                        continue;
                    }
                };

                let upstream = upstream.clone();
                let force = force.clone();
                tracker.spawn(async move {
                    serve_client(stream, peer, upstream, force).await;
                });
            }
            debug!(addr = %bind_addr, "accept loop exited");
        })
    };

    Ok(ListenerHandle {
        service_id,
        bind_addr,
        cancel,
        force,
        tracker,
        accept_task,
    })
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    upstream: Arc<Upstream>,
    force: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let upstream = upstream.clone();
        async move { proxy_request(req, upstream, peer.ip()).await }
    });

    let conn = server_http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(err) = result {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        }
        _ = force.cancelled() => {
            debug!(peer = %peer, "connection force-closed during shutdown");
        }
    }
}

/// Single upstream with a small pool of idle HTTP/1 connections.
struct Upstream {
    authority: String,
    pool: Mutex<Vec<client_http1::SendRequest<Incoming>>>,
}

impl Upstream {
    /// Recycle a sender once its in-flight response completes.
    fn recycle(self: &Arc<Self>, mut sender: client_http1::SendRequest<Incoming>) {
        let upstream = self.clone();
        tokio::spawn(async move {
            if sender.ready().await.is_ok() {
                let mut pool = upstream.pool.lock().await;
                if pool.len() < MAX_POOL_SIZE {
                    pool.push(sender);
                }
            }
        });
    }

    /// Dedicated connection for Upgrade requests; never pooled.
    async fn upgrade_connection(
        &self,
    ) -> Result<client_http1::SendRequest<Empty<Bytes>>, ProxyPathError> {
        let stream = TcpStream::connect(&self.authority)
            .await
            .map_err(ProxyPathError::Connect)?;
        let (sender, conn) = client_http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyPathError::Upstream)?;
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                debug!(error = %err, "upstream upgrade connection closed");
            }
        });
        Ok(sender)
    }
}

async fn proxy_request(
    mut req: Request<Incoming>,
    upstream: Arc<Upstream>,
    client_ip: IpAddr,
) -> Result<Response<ProxyBody>, std::convert::Infallible> {
    rewrite_request_headers(&mut req, &upstream.authority, client_ip);

    let result = if req.headers().contains_key(UPGRADE) {
        proxy_upgrade(req, &upstream).await
    } else {
        proxy_plain(req, &upstream).await
    };

    match result {
        Ok(response) => Ok(response),
        Err(err) => {
            error!(upstream = %upstream.authority, error = %err, "proxy error");
            Ok(bad_gateway())
        }
    }
}

/// Rewrites `Host` to the upstream authority and fills in the forwarding
/// headers when the client did not already set them.
fn rewrite_request_headers<B>(req: &mut Request<B>, authority: &str, client_ip: IpAddr) {
    if let Ok(value) = HeaderValue::from_str(authority) {
        req.headers_mut().insert(HOST, value);
    }
    if !req.headers().contains_key("x-forwarded-proto") {
        req.headers_mut()
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
    if !req.headers().contains_key("x-forwarded-for") {
        if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
            req.headers_mut().insert("x-forwarded-for", value);
        }
    }
}

async fn proxy_plain(
    req: Request<Incoming>,
    upstream: &Arc<Upstream>,
) -> Result<Response<ProxyBody>, ProxyPathError> {
    let mut sender = connect_upstream(upstream).await?;

    let response = timeout(UPSTREAM_TIMEOUT, sender.send_request(req))
        .await
        .map_err(|_| ProxyPathError::Timeout)??;

    upstream.recycle(sender);
    Ok(response.map(BodyExt::boxed))
}

async fn proxy_upgrade(
    mut req: Request<Incoming>,
    upstream: &Arc<Upstream>,
) -> Result<Response<ProxyBody>, ProxyPathError> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    // The request head travels on a dedicated connection; the body of an
    // upgrade request is empty by definition.
    let mut builder = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone());
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }
    let up_req = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProxyPathError::BadRequest(e.to_string()))?;

    let mut sender = timeout(UPSTREAM_TIMEOUT, upstream.upgrade_connection())
        .await
        .map_err(|_| ProxyPathError::Timeout)??;

    let mut response = timeout(UPSTREAM_TIMEOUT, sender.send_request(up_req))
        .await
        .map_err(|_| ProxyPathError::Timeout)??;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((up, down)) => {
                            debug!(bytes_up = up, bytes_down = down, "upgrade bridge closed");
                        }
                        Err(err) => debug!(error = %err, "upgrade bridge ended with error"),
                    }
                }
                Err(err) => warn!(error = %err, "upgrade handshake failed"),
            }
        });
    }

    Ok(response.map(BodyExt::boxed))
}

async fn connect_upstream(
    upstream: &Arc<Upstream>,
) -> Result<client_http1::SendRequest<Incoming>, ProxyPathError> {
    {
        let mut pool = upstream.pool.lock().await;
        while let Some(sender) = pool.pop() {
            if sender.is_ready() {
                return Ok(sender);
            }
        }
    }

    let stream = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(&upstream.authority))
        .await
        .map_err(|_| ProxyPathError::Timeout)?
        .map_err(ProxyPathError::Connect)?;

    let (sender, conn) = client_http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ProxyPathError::Upstream)?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "upstream connection closed");
        }
    });
    Ok(sender)
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = http_body_util::Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

#[derive(Debug, thiserror::Error)]
enum ProxyPathError {
    #[error("failed to connect to upstream: {0}")]
    Connect(std::io::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    BadRequest(String),
}
