//! API tests driven through the router with `tower::ServiceExt`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use arqut_api::{router, AppState};
use arqut_proxy::{PortAllocator, ServiceManager};
use arqut_store::{open_in_memory, ServiceCatalog};

async fn test_router(range: (u16, u16)) -> Router {
    let catalog = ServiceCatalog::new(open_in_memory().await.unwrap());
    let manager = ServiceManager::new(catalog, PortAllocator::new(range.0, range.1), 3030);
    router(Arc::new(AppState {
        manager,
        tunnels: None,
    }))
}

async fn send(router: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn create_and_list_service() {
    let router = test_router((18400, 18409)).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({
            "name": "web",
            "protocol": "http",
            "local_host": "localhost",
            "local_port": 80
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    let tunnel_port = body["data"]["tunnel_port"].as_u64().unwrap();
    assert!((18400..=18409).contains(&(tunnel_port as u16)));
    assert_eq!(body["data"]["enabled"], json!(true));

    let (status, body) = send(&router, "GET", "/api/services", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = body["data"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], json!("web"));
    assert_eq!(list[0]["local_port"], json!(80));
}

#[tokio::test]
async fn create_requires_name_and_host() {
    let router = test_router((18410, 18419)).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({ "protocol": "http", "local_port": 80 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body["error"]["message"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn create_validates_port_bounds() {
    let router = test_router((18420, 18429)).await;

    for bad_port in [0, 65536] {
        let (status, _) = send(
            &router,
            "POST",
            "/api/services",
            Some(json!({
                "name": "web",
                "local_host": "localhost",
                "local_port": bad_port
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "port {bad_port}");
    }
}

#[tokio::test]
async fn ws_is_normalized_to_websocket() {
    let router = test_router((18430, 18439)).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({
            "name": "socket",
            "protocol": "ws",
            "local_host": "localhost",
            "local_port": 8080
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["protocol"], json!("websocket"));

    let (status, _) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({
            "name": "bad",
            "protocol": "tcp",
            "local_host": "localhost",
            "local_port": 8081
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_host_port_conflicts() {
    let router = test_router((18440, 18449)).await;

    let body = json!({ "name": "one", "local_host": "localhost", "local_port": 9000 });
    let (status, _) = send(&router, "POST", "/api/services", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, envelope) = send(&router, "POST", "/api/services", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(envelope["success"], json!(false));
}

#[tokio::test]
async fn update_enable_disable_delete_lifecycle() {
    let router = test_router((18450, 18459)).await;

    let (_, body) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({ "name": "web", "local_host": "localhost", "local_port": 80 })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/api/services/{id}"),
        Some(json!({ "name": "renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &router,
        "PATCH",
        &format!("/api/services/{id}/disable"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, "GET", "/api/services", None).await;
    assert_eq!(body["data"][0]["name"], json!("renamed"));
    assert_eq!(body["data"][0]["enabled"], json!(false));

    let (status, _) = send(&router, "PATCH", &format!("/api/services/{id}/enable"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&router, "DELETE", &format!("/api/services/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, "DELETE", &format!("/api/services/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn update_rejects_empty_fields() {
    let router = test_router((18460, 18469)).await;

    let (_, body) = send(
        &router,
        "POST",
        "/api/services",
        Some(json!({ "name": "web", "local_host": "localhost", "local_port": 80 })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/api/services/{id}"),
        Some(json!({ "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The failed update must not have touched the row.
    let (_, body) = send(&router, "GET", "/api/services", None).await;
    assert_eq!(body["data"][0]["name"], json!("web"));
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let router = test_router((18470, 18479)).await;
    let (status, _) = send(
        &router,
        "PUT",
        "/api/services/zzzzzzzz",
        Some(json!({ "name": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_healthy() {
    let router = test_router((18480, 18489)).await;
    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
}

#[tokio::test]
async fn wireguard_endpoints_need_cloud_connectivity() {
    let router = test_router((18490, 18499)).await;
    let (status, body) = send(&router, "GET", "/api/wireguard/peers", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], json!(false));
}
