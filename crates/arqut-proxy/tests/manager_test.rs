//! Service manager integration tests with real sockets on loopback.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use arqut_proto::Protocol;
use arqut_proxy::{PortAllocator, ServiceManager};
use arqut_store::{open_in_memory, ServiceCatalog, ServicePatch};

const WAIT: Duration = Duration::from_secs(1);

async fn manager_with_range(start: u16, end: u16) -> ServiceManager {
    let catalog = ServiceCatalog::new(open_in_memory().await.unwrap());
    ServiceManager::new(catalog, PortAllocator::new(start, end), 3030)
}

/// Headers captured by the mock upstream for each request.
struct SeenRequest {
    host: String,
    forwarded_for: Option<String>,
    forwarded_proto: Option<String>,
    path: String,
}

async fn spawn_upstream(body: &'static str) -> (u16, mpsc::UnboundedReceiver<SeenRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .map(|v| v.to_str().unwrap_or("").to_string())
                        };
                        let _ = seen_tx.send(SeenRequest {
                            host: header("host").unwrap_or_default(),
                            forwarded_for: header("x-forwarded-for"),
                            forwarded_proto: header("x-forwarded-proto"),
                            path: req.uri().to_string(),
                        });
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                            body.as_bytes(),
                        ))))
                    }
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (port, seen_rx)
}

async fn http_get(addr: &str, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header("host", addr.to_string())
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

async fn wait_for_listener(addr: String) {
    timeout(WAIT, async {
        loop {
            if TcpStream::connect(&addr).await.is_ok() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no listener accepted on {addr} within 1s"));
}

#[tokio::test]
async fn bootstrap_publishes_edge_ui_once() {
    let manager = manager_with_range(18200, 18209).await;

    manager.start().await.unwrap();
    let services = manager.list_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "Edge UI");
    assert_eq!(services[0].local_port, 3030);
    assert!(services[0].enabled);
    manager.stop().await;

    // Second start must not duplicate the row.
    manager.start().await.unwrap();
    assert_eq!(manager.list_services().await.unwrap().len(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn proxies_response_and_rewrites_headers() {
    let (upstream_port, mut seen) = spawn_upstream("hi").await;
    let manager = manager_with_range(18210, 18219).await;
    manager.start().await.unwrap();

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.add_interface("lo", "127.0.0.1").await;

    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    wait_for_listener(addr.clone()).await;

    let (status, body) = http_get(&addr, "/greeting?x=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hi");

    let req = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(req.host, format!("localhost:{upstream_port}"));
    assert_eq!(req.forwarded_for.as_deref(), Some("127.0.0.1"));
    assert_eq!(req.forwarded_proto.as_deref(), Some("http"));
    assert_eq!(req.path, "/greeting?x=1");

    manager.stop().await;
}

#[tokio::test]
async fn upstream_down_yields_502_and_keeps_service_enabled() {
    let manager = manager_with_range(18220, 18229).await;
    manager.start().await.unwrap();

    // Nothing listens on this local port.
    let svc = manager
        .add_service("dead", "127.0.0.1", 1, Protocol::Http)
        .await
        .unwrap();
    manager.add_interface("lo", "127.0.0.1").await;

    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    wait_for_listener(addr.clone()).await;

    let (status, _) = http_get(&addr, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let row = manager.get_service(&svc.id).await.unwrap();
    assert!(row.enabled, "a 502 must not change catalog state");

    manager.stop().await;
}

#[tokio::test]
async fn interface_add_starts_listeners_within_a_second() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18230, 18239).await;
    manager.start().await.unwrap();

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();

    // No interfaces yet: nothing may be bound.
    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    assert!(TcpStream::connect(&addr).await.is_err());

    manager.add_interface("lo", "127.0.0.1").await;
    wait_for_listener(addr).await;

    manager.stop().await;
}

#[tokio::test]
async fn fleet_is_enabled_services_times_interfaces() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18240, 18249).await;

    // Created while idle so the bootstrap row does not join the fleet.
    let a = manager
        .add_service("a", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    let b = manager
        .add_service("b", "127.0.0.1", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.disable_service(&b.id).await.unwrap();
    manager.start().await.unwrap();

    let mut ips = HashMap::new();
    ips.insert("lo".to_string(), "127.0.0.1".to_string());
    ips.insert("lo2".to_string(), "127.0.0.2".to_string());
    manager.set_interface_ips(ips).await;

    // Only the enabled service is listening, once per interface.
    let listeners = manager.running_listeners();
    assert_eq!(listeners.len(), 2);
    assert!(listeners.iter().all(|(id, _)| id == &a.id));
    let mut bound: Vec<String> = listeners
        .iter()
        .map(|(_, addr)| addr.ip().to_string())
        .collect();
    bound.sort();
    assert_eq!(bound, vec!["127.0.0.1", "127.0.0.2"]);

    // Re-enabling B adds exactly one listener per interface.
    manager.enable_service(&b.id).await.unwrap();
    assert_eq!(manager.listener_count(), 4);

    manager.stop().await;
}

#[tokio::test]
async fn enable_twice_keeps_a_single_listener_per_interface() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18250, 18259).await;

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.add_interface("lo", "127.0.0.1").await;
    assert_eq!(manager.listener_count(), 1);

    manager.enable_service(&svc.id).await.unwrap();
    manager.enable_service(&svc.id).await.unwrap();
    assert_eq!(manager.listener_count(), 1);

    let row = manager.get_service(&svc.id).await.unwrap();
    assert!(row.enabled);

    manager.stop().await;
}

#[tokio::test]
async fn setting_identical_interfaces_is_a_noop() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18260, 18269).await;

    manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.start().await.unwrap();

    let mut ips = HashMap::new();
    ips.insert("lo".to_string(), "127.0.0.1".to_string());
    manager.set_interface_ips(ips.clone()).await;
    let before: Vec<_> = manager.running_listeners();
    assert_eq!(before.len(), 1);

    manager.set_interface_ips(ips).await;
    let after: Vec<_> = manager.running_listeners();
    assert_eq!(after.len(), 1);
    assert_eq!(before[0].1, after[0].1);

    manager.stop().await;
}

#[tokio::test]
async fn modify_points_listeners_at_the_new_upstream() {
    let (old_port, _old_seen) = spawn_upstream("old").await;
    let (new_port, _new_seen) = spawn_upstream("new").await;
    let manager = manager_with_range(18270, 18279).await;
    manager.start().await.unwrap();

    let svc = manager
        .add_service("web", "127.0.0.1", old_port, Protocol::Http)
        .await
        .unwrap();
    manager.add_interface("lo", "127.0.0.1").await;

    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    wait_for_listener(addr.clone()).await;
    let (_, body) = http_get(&addr, "/").await;
    assert_eq!(body, "old");

    manager
        .modify_service(
            &svc.id,
            ServicePatch {
                local_port: Some(new_port),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    wait_for_listener(addr.clone()).await;
    let (_, body) = http_get(&addr, "/").await;
    assert_eq!(body, "new");

    manager.stop().await;
}

#[tokio::test]
async fn delete_stops_listeners_and_second_delete_is_not_found() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18280, 18289).await;

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.start().await.unwrap();
    manager.add_interface("lo", "127.0.0.1").await;
    assert_eq!(manager.listener_count(), 1);

    manager.delete_service(&svc.id).await.unwrap();
    assert_eq!(manager.listener_count(), 0);

    let err = manager.delete_service(&svc.id).await.unwrap_err();
    assert!(matches!(
        err,
        arqut_proxy::ProxyError::Catalog(arqut_store::CatalogError::NotFound(_))
    ));

    manager.stop().await;
}

#[tokio::test]
async fn stop_closes_every_socket() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18290, 18299).await;
    manager.start().await.unwrap();

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.add_interface("lo", "127.0.0.1").await;

    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    wait_for_listener(addr.clone()).await;

    manager.stop().await;
    assert_eq!(manager.listener_count(), 0);
    assert!(!manager.is_running().await);
    assert!(TcpStream::connect(&addr).await.is_err());
}

#[tokio::test]
async fn mutations_while_idle_persist_but_start_nothing() {
    let (upstream_port, _seen) = spawn_upstream("ok").await;
    let manager = manager_with_range(18300, 18309).await;

    let svc = manager
        .add_service("web", "localhost", upstream_port, Protocol::Http)
        .await
        .unwrap();
    manager.add_interface("lo", "127.0.0.1").await;
    assert_eq!(manager.listener_count(), 0);

    manager.start().await.unwrap();
    let addr = format!("127.0.0.1:{}", svc.tunnel_port);
    wait_for_listener(addr).await;

    manager.stop().await;
}
