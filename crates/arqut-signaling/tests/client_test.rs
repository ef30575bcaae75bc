//! Signaling client integration tests against a local mock cloud.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use arqut_proto::SignalMessage;
use arqut_signaling::SignalingClient;

const WAIT: Duration = Duration::from_secs(5);

/// Mock cloud: accepts WebSocket connections, captures handshake requests
/// and inbound frames, and lets the test push frames to the client.
struct MockCloud {
    port: u16,
    handshakes: mpsc::UnboundedReceiver<Request>,
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    drop_conn: mpsc::UnboundedSender<()>,
}

async fn spawn_mock_cloud() -> MockCloud {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handshake_tx, handshakes) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (drop_tx, mut drop_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handshake_tx = handshake_tx.clone();
            let callback = move |req: &Request, resp: Response| {
                let mut captured = Request::new(());
                *captured.uri_mut() = req.uri().clone();
                *captured.headers_mut() = req.headers().clone();
                let _ = handshake_tx.send(captured);
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(msg) = serde_json::from_str(&text) {
                                let _ = inbound_tx.send(msg);
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            let text = serde_json::to_string(&msg).unwrap();
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => return,
                    },
                    _ = drop_rx.recv() => {
                        break;
                    }
                }
            }
            // Connection dropped; loop back to accept the reconnect.
        }
    });

    MockCloud {
        port,
        handshakes,
        inbound,
        outbound: outbound_tx,
        drop_conn: drop_tx,
    }
}

#[tokio::test]
async fn handshake_carries_identity_and_bearer_token() {
    let mut cloud = spawn_mock_cloud().await;

    let client = SignalingClient::new(&format!("http://127.0.0.1:{}", cloud.port), "edgehost", 3030);
    client.connect("edge-abc", "secret-key").await;

    let req = timeout(WAIT, cloud.handshakes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(req.uri().path(), "/api/v1/signaling/ws/edge");
    let query = req.uri().query().unwrap();
    assert!(query.contains("id=edge-abc"));
    assert!(query.contains("host=edgehost"));
    assert!(query.contains("port=3030"));
    assert_eq!(
        req.headers().get("Authorization").unwrap(),
        "Bearer secret-key"
    );
    assert!(client.is_connected().await);

    client.close().await;
}

#[tokio::test]
async fn dispatches_by_type_and_drops_unknown() {
    let mut cloud = spawn_mock_cloud().await;

    let client = SignalingClient::new(&format!("http://127.0.0.1:{}", cloud.port), "h", 1);
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<SignalMessage>();
    client.register_handler("greeting", move |msg| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(msg);
            Ok(())
        }
    });

    client.connect("edge-1", "key").await;
    timeout(WAIT, cloud.handshakes.recv()).await.unwrap();

    // An unknown type must be dropped without killing the connection.
    cloud
        .outbound
        .send(SignalMessage::new("mystery", None, None, &json!({})).unwrap())
        .unwrap();
    cloud
        .outbound
        .send(SignalMessage::new("greeting", Some("cloud".into()), None, &json!({"v": 1})).unwrap())
        .unwrap();

    let msg = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.kind, "greeting");
    assert_eq!(msg.from.as_deref(), Some("cloud"));
    assert_eq!(msg.data, json!({"v": 1}));

    client.close().await;
}

#[tokio::test]
async fn send_preserves_order_within_a_connection() {
    let mut cloud = spawn_mock_cloud().await;

    let client = SignalingClient::new(&format!("http://127.0.0.1:{}", cloud.port), "h", 1);
    client.connect("edge-1", "key").await;
    timeout(WAIT, cloud.handshakes.recv()).await.unwrap();

    for i in 0..10 {
        client
            .send("seq", None, None, &json!({ "n": i }))
            .await
            .unwrap();
    }

    for i in 0..10 {
        let msg = timeout(WAIT, cloud.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(msg.kind, "seq");
        assert_eq!(msg.data["n"], json!(i));
    }

    client.close().await;
}

#[tokio::test]
async fn reconnects_after_drop_and_reruns_on_connect_handlers() {
    let mut cloud = spawn_mock_cloud().await;

    let client = SignalingClient::new(&format!("http://127.0.0.1:{}", cloud.port), "h", 1);
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    client.add_on_connect(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    client.connect("edge-1", "key").await;
    timeout(WAIT, cloud.handshakes.recv()).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // Kill the connection server-side; the client must redial on its own.
    cloud.drop_conn.send(()).unwrap();
    timeout(WAIT, cloud.handshakes.recv()).await.unwrap();

    // On-connect handlers run once per successful connection.
    timeout(WAIT, async {
        while connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert!(client.is_connected().await);

    client.close().await;
}
