use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HandlerError, SignalingError};
use arqut_proto::SignalMessage;

const SIGNALING_PATH: &str = "/api/v1/signaling/ws/edge";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);
const OUTBOUND_QUEUE_CAPACITY: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type MessageHandler = Arc<dyn Fn(SignalMessage) -> HandlerFuture + Send + Sync>;
type ConnectHandler = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

/// A message queued on the fire-and-forget outbound path.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub data: serde_json::Value,
}

impl OutboundMessage {
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            from: None,
            to: None,
            data: serde_json::to_value(data)?,
        })
    }
}

#[derive(Clone)]
struct Credentials {
    edge_id: String,
    api_key: String,
}

/// WebSocket client for the cloud signaling channel. Cheap to clone.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    cloud_url: String,
    /// Host/port this edge advertises in the connection query string.
    local_host: String,
    local_port: u16,

    credentials: RwLock<Option<Credentials>>,
    writer: Mutex<Option<WsSink>>,

    handlers: RwLock<HashMap<String, MessageHandler>>,
    on_connect: RwLock<Vec<ConnectHandler>>,

    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: StdMutex<Option<mpsc::Receiver<OutboundMessage>>>,
    pump_started: AtomicBool,

    /// Cancelled when `close()` is called; parents every worker token.
    cancel: CancellationToken,
    /// Token of the current connection's reader/keepalive workers.
    conn_token: StdMutex<Option<CancellationToken>>,
    reconnecting: AtomicBool,
}

impl SignalingClient {
    pub fn new(cloud_url: &str, local_host: &str, local_port: u16) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                cloud_url: cloud_url.trim_end_matches('/').to_string(),
                local_host: local_host.to_string(),
                local_port,
                credentials: RwLock::new(None),
                writer: Mutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                on_connect: RwLock::new(Vec::new()),
                outbound_tx,
                outbound_rx: StdMutex::new(Some(outbound_rx)),
                pump_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                conn_token: StdMutex::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Register a handler for one message type. Later registrations for
    /// the same type replace earlier ones.
    pub fn register_handler<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(SignalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.inner
            .handlers
            .write()
            .expect("handler lock poisoned")
            .insert(kind.to_string(), handler);
    }

    /// Register a handler invoked after every successful (re)connection,
    /// in registration order.
    pub fn add_on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: ConnectHandler = Arc::new(move || Box::pin(handler()));
        self.inner
            .on_connect
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    /// Sender half of the bounded outbound queue.
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.inner.outbound_tx.clone()
    }

    /// Non-blocking enqueue. A full queue is reported to the caller, who
    /// decides whether dropping matters.
    pub fn try_enqueue(&self, msg: OutboundMessage) -> Result<(), SignalingError> {
        self.inner
            .outbound_tx
            .try_send(msg)
            .map_err(|_| SignalingError::QueueFull)
    }

    /// Start the connection lifecycle. A failed initial attempt does not
    /// surface to the caller; the client keeps retrying in the background.
    pub async fn connect(&self, edge_id: &str, api_key: &str) {
        *self
            .inner
            .credentials
            .write()
            .expect("credentials lock poisoned") = Some(Credentials {
            edge_id: edge_id.to_string(),
            api_key: api_key.to_string(),
        });

        self.start_outbound_pump();

        if let Err(err) = self.inner.connect_once().await {
            warn!(error = %err, "initial signaling connection failed, retrying in background");
            Inner::spawn_reconnect(self.inner.clone());
        }
    }

    /// Synchronous send: serializes and writes the frame on the current
    /// socket, in call order. Fails when disconnected.
    pub async fn send<T: Serialize>(
        &self,
        kind: &str,
        from: Option<String>,
        to: Option<String>,
        data: &T,
    ) -> Result<(), SignalingError> {
        let msg = SignalMessage::new(kind, from, to, data)?;
        self.inner.write_frame(&msg).await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.writer.lock().await.is_some()
    }

    /// Tear down the lifecycle: cancels all workers and closes the socket.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        info!("signaling connection closed");
    }
}

impl Inner {
    fn ws_url(&self, edge_id: &str) -> String {
        let base = if let Some(rest) = self.cloud_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.cloud_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.cloud_url.clone()
        };
        format!(
            "{base}{SIGNALING_PATH}?id={edge_id}&host={}&port={}&os={}",
            self.local_host,
            self.local_port,
            std::env::consts::OS
        )
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), SignalingError> {
        let creds = self
            .credentials
            .read()
            .expect("credentials lock poisoned")
            .clone()
            .ok_or(SignalingError::NotConfigured)?;

        let url = self.ws_url(&creds.edge_id);
        debug!(%url, "connecting to signaling server");

        let mut request = url
            .into_client_request()
            .map_err(SignalingError::Transport)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", creds.api_key))
            .map_err(|e| SignalingError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| SignalingError::Handshake("handshake timed out".into()))??;

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);

        // Replace the previous connection's worker token. Only one
        // reader/keepalive pair may be live at a time.
        let token = self.cancel.child_token();
        if let Some(old) = self
            .conn_token
            .lock()
            .expect("conn token lock poisoned")
            .replace(token.clone())
        {
            old.cancel();
        }

        info!("connected to signaling server");

        let connect_handlers: Vec<ConnectHandler> = self
            .on_connect
            .read()
            .expect("handler lock poisoned")
            .clone();
        for handler in connect_handlers {
            if let Err(err) = handler().await {
                warn!(error = %err, "on-connect handler failed");
            }
        }

        tokio::spawn(Self::read_loop(self.clone(), source, token.clone()));
        tokio::spawn(Self::keepalive(self.clone(), token));

        Ok(())
    }

    async fn write_frame(&self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let text = serde_json::to_string(msg)?;
        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(SignalingError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn read_loop(inner: Arc<Self>, mut source: WsSource, token: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return,
                frame = source.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_bytes()).await,
                Some(Ok(Message::Binary(data))) => inner.dispatch(&data).await,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    warn!("signaling connection closed by remote");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => {
                    error!(error = %err, "signaling read error");
                    break;
                }
            }
        }

        token.cancel();
        if !inner.cancel.is_cancelled() {
            Self::spawn_reconnect(inner);
        }
    }

    async fn dispatch(&self, raw: &[u8]) {
        let msg: SignalMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "failed to parse signaling frame");
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .get(&msg.kind)
            .cloned();

        match handler {
            Some(handler) => {
                let kind = msg.kind.clone();
                if let Err(err) = handler(msg).await {
                    warn!(%kind, error = %err, "signaling handler failed");
                }
            }
            None => debug!(kind = %msg.kind, "no handler for message type, dropping"),
        }
    }

    async fn keepalive(inner: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let mut guard = inner.writer.lock().await;
            if let Some(sink) = guard.as_mut() {
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    // The read loop will observe the broken socket.
                    warn!(error = %err, "signaling ping failed");
                }
            }
        }
    }

    /// Single long-lived worker draining the outbound queue. Messages
    /// arriving while disconnected are dropped with a log line; the next
    /// resync supersedes them.
    fn start_pump(self: &Arc<Self>) -> Option<mpsc::Receiver<OutboundMessage>> {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.outbound_rx
            .lock()
            .expect("outbound rx lock poisoned")
            .take()
    }

    async fn outbound_pump(inner: Arc<Self>, mut rx: mpsc::Receiver<OutboundMessage>) {
        loop {
            let msg = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { return };

            let frame = SignalMessage {
                kind: msg.kind,
                from: msg.from,
                to: msg.to,
                data: msg.data,
            };
            match inner.write_frame(&frame).await {
                Ok(()) => {}
                Err(SignalingError::NotConnected) => {
                    warn!(kind = %frame.kind, "dropping outbound message (disconnected)");
                }
                Err(err) => {
                    warn!(kind = %frame.kind, error = %err, "failed to send outbound message");
                }
            }
        }
    }

    /// Kick off the reconnect loop unless one is already running.
    fn spawn_reconnect(inner: Arc<Self>) {
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            inner.reconnect_loop().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        // Drop the dead socket first so send() reports NotConnected and
        // the single-socket invariant holds while we redial.
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(token) = self
            .conn_token
            .lock()
            .expect("conn token lock poisoned")
            .take()
        {
            token.cancel();
        }

        let mut backoff = RECONNECT_BACKOFF_START;
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_cancelled() {
                info!("reconnection stopped, client closed");
                return;
            }

            info!(attempt, "attempting signaling reconnect");
            match self.connect_once().await {
                Ok(()) => {
                    info!(attempt, "signaling reconnected");
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, backoff_secs = backoff.as_secs(), "reconnect failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    attempt += 1;
                }
            }
        }
    }
}

impl SignalingClient {
    fn start_outbound_pump(&self) {
        if let Some(rx) = self.inner.start_pump() {
            tokio::spawn(Inner::outbound_pump(self.inner.clone(), rx));
        }
    }
}
