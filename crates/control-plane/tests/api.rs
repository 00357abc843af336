#[path = "support/common.rs"]
mod common;

use ::common::api::ServerStatus;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TEST_API_TOKEN, setup_app, setup_node, store_key};
use http_body_util::BodyExt;
use tower::ServiceExt;

fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TEST_API_TOKEN}"));
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test]
async fn health_is_public() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn v1_requires_a_valid_bearer_token() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let bare = Request::builder()
        .uri("/v1/keys")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(bare).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/v1/keys")
        .header(header::AUTHORIZATION, "Bearer wrong-token-123456")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn key_crud_round_trip() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let (status, created) = send(
        &app,
        authed(
            "POST",
            "/v1/keys",
            Some(serde_json::json!({
                "cipher": "aes-128-gcm",
                "secret": "abcdef",
                "name": "alice",
                "quota": 0,
                "enabled": true
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "k-1");
    assert_eq!(created["code"].as_str().expect("code").len(), 32);
    assert_eq!(created["used"], 0);

    let (status, listed) = send(&app, authed("GET", "/v1/keys", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().expect("array").len(), 1);

    let (status, updated) = send(
        &app,
        authed(
            "PUT",
            "/v1/keys",
            Some(serde_json::json!({
                "id": "k-1",
                "cipher": "aes-256-gcm",
                "secret": "abcdef",
                "name": "alice-renamed",
                "quota": 50,
                "enabled": false
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "alice-renamed");
    assert_eq!(updated["cipher"], "aes-256-gcm");
    assert_eq!(updated["enabled"], false);
    // The public code survives updates.
    assert_eq!(updated["code"], created["code"]);

    let (status, _) = send(&app, authed("DELETE", "/v1/keys/k-1", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, listed) = send(&app, authed("GET", "/v1/keys", None)).await;
    assert!(listed.as_array().expect("array").is_empty());
}

#[tokio::test]
async fn duplicate_secret_is_rejected_with_400() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);
    store_key(&node, "shared", "alice", 0).await;

    let (status, body) = send(
        &app,
        authed(
            "POST",
            "/v1/keys",
            Some(serde_json::json!({
                "cipher": "aes-128-gcm",
                "secret": "shared",
                "name": "bob",
                "quota": 0,
                "enabled": true
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["message"]
            .as_str()
            .expect("message")
            .contains("already exists")
    );
    assert_eq!(node.db.keys().await.len(), 1);
}

#[tokio::test]
async fn updating_an_unknown_key_returns_404() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let (status, body) = send(
        &app,
        authed(
            "PUT",
            "/v1/keys",
            Some(serde_json::json!({
                "id": "k-9",
                "cipher": "aes-128-gcm",
                "secret": "abcdef",
                "name": "ghost",
                "quota": 0,
                "enabled": true
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn refill_replaces_the_whole_key_set() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);
    store_key(&node, "old-secret", "old", 0).await;

    let (status, _) = send(
        &app,
        authed(
            "POST",
            "/v1/keys/refill",
            Some(serde_json::json!([
                {
                    "id": "k-5",
                    "code": "",
                    "cipher": "chacha20-ietf-poly1305",
                    "secret": "pushed-secret",
                    "name": "pushed",
                    "quota": 10,
                    "enabled": true
                }
            ])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let keys = node.db.keys().await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, "k-5");

    // The counter continues past the pushed ordinals.
    let next = store_key(&node, "new-secret", "new", 0).await;
    assert_eq!(next.id, "k-6");
}

#[tokio::test]
async fn refill_with_duplicate_secrets_returns_400() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let entry = |id: &str| {
        serde_json::json!({
            "id": id,
            "code": "",
            "cipher": "aes-128-gcm",
            "secret": "shared",
            "name": id,
            "quota": 0,
            "enabled": true
        })
    };
    let (status, _) = send(
        &app,
        authed(
            "POST",
            "/v1/keys/refill",
            Some(serde_json::json!([entry("k-1"), entry("k-2")])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(node.db.keys().await.is_empty());
}

#[tokio::test]
async fn settings_show_serves_the_pull_payload() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let (status, body) = send(&app, authed("GET", "/v1/settings", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_token"], TEST_API_TOKEN);
    assert_eq!(body["http_port"], 8080);
    assert!(body["shadowsocks_enabled"].is_boolean());
    assert!(body["shadowsocks_port"].is_u64());
}

#[tokio::test]
async fn settings_update_persists_and_validates() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let mut settings = node.db.settings().await;
    settings.shadowsocks_port = 8388;
    settings.traffic_ratio = 1.5;
    let (status, body) = send(
        &app,
        authed(
            "POST",
            "/v1/settings",
            Some(serde_json::to_value(&settings).expect("settings json")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shadowsocks_port"], 8388);
    assert_eq!(node.db.settings().await.traffic_ratio, 1.5);

    settings.traffic_ratio = 0.5;
    let (status, _) = send(
        &app,
        authed(
            "POST",
            "/v1/settings",
            Some(serde_json::to_value(&settings).expect("settings json")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(node.db.settings().await.traffic_ratio, 1.5);
}

#[tokio::test]
async fn servers_index_leads_with_the_synthetic_local_node() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let (status, body) = send(&app, authed("GET", "/v1/servers", None)).await;
    assert_eq!(status, StatusCode::OK);
    let servers = body.as_array().expect("array");
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["id"], "s-0");
    assert_eq!(servers[0]["status"], "active");
    assert_eq!(servers[0]["http_port"], 8080);
}

#[tokio::test]
async fn server_crud_preserves_pull_owned_fields() {
    let node = setup_node("127.0.0.1", 9);
    let app = setup_app(&node);

    let (status, created) = send(
        &app,
        authed(
            "POST",
            "/v1/servers",
            Some(serde_json::json!({
                "http_host": "203.0.113.4",
                "http_port": 8080,
                "api_token": "peer-token-1234567890"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "s-1");
    assert_eq!(created["status"], "processing");

    // Simulate a pull having populated the peer's engine fields.
    let mut stored = node.db.find_server("s-1").await.expect("server");
    stored.status = ServerStatus::Active;
    stored.shadowsocks_enabled = true;
    stored.shadowsocks_host = "203.0.113.4".into();
    stored.shadowsocks_port = 8388;
    node.db
        .update_server(stored)
        .await
        .expect("seed")
        .expect("found");

    let (status, updated) = send(
        &app,
        authed(
            "PUT",
            "/v1/servers",
            Some(serde_json::json!({
                "id": "s-1",
                "http_host": "203.0.113.99",
                "http_port": 9090,
                "api_token": "rotated-token-1234567890"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["http_host"], "203.0.113.99");
    assert_eq!(updated["http_port"], 9090);
    // Peer-reported fields and status are not operator-settable.
    assert_eq!(updated["shadowsocks_host"], "203.0.113.4");
    assert_eq!(updated["shadowsocks_port"], 8388);
    assert_eq!(updated["status"], "active");

    let (status, _) = send(
        &app,
        authed(
            "PUT",
            "/v1/servers",
            Some(serde_json::json!({
                "id": "s-9",
                "http_host": "203.0.113.99",
                "http_port": 9090,
                "api_token": "rotated-token-1234567890"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, authed("DELETE", "/v1/servers/s-1", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(node.db.servers().await.is_empty());
}
