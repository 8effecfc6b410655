use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use burnlink_server::handlers::{CreateLinkResponse, RedeemLinkResponse};
use burnlink_server::issuance::IssuePolicy;
use burnlink_server::store::{now_millis, NewSecret, SecretStore, Store};
use burnlink_server::{build_router, crypto, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-test-token";

struct TestApp {
    _dir: TempDir,
    state: AppState,
    router: Router,
}

fn app(admin_token: Option<&str>) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("burnlink.db")).expect("open store");
    let state = AppState::new(
        store,
        IssuePolicy::default(),
        Duration::from_secs(5),
        admin_token.map(str::to_owned),
    );
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let router = build_router(state.clone(), None).layer(MockConnectInfo(peer));
    TestApp {
        _dir: dir,
        state,
        router,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            panic!("non-json body: {}", String::from_utf8_lossy(&body))
        })
    };
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create(router: &Router, content: &str, minutes: i64) -> CreateLinkResponse {
    let (status, body) = send(
        router,
        post_json(
            "/links",
            json!({"content": content, "expiresInMinutes": minutes}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
    serde_json::from_value(body).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let t = app(None);
    let (status, body) = send(&t.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn swordfish_is_readable_exactly_once() {
    let t = app(None);
    let created = create(&t.router, "the password is swordfish", 5).await;
    assert!(created.success);
    assert_eq!(created.access_token.len(), 36);
    assert!(created.expires_at.ends_with('Z'));

    let uri = format!("/links/{}", created.access_token);
    let response = t.router.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let redeemed: RedeemLinkResponse = serde_json::from_slice(&body).unwrap();
    assert!(redeemed.success);
    assert_eq!(redeemed.content, "the password is swordfish");
    assert!(redeemed.created_at.ends_with('Z'));

    let (status, body) = send(&t.router, get(&uri)).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["reason"], "already_accessed");
    assert!(body["error"].as_str().unwrap().contains("already accessed"));
}

#[tokio::test]
async fn redeem_by_query_parameter() {
    let t = app(None);
    let created = create(&t.router, "query style", 10).await;

    let uri = format!("/links?token={}", created.access_token);
    let (status, body) = send(&t.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "query style");

    let (status, body) = send(&t.router, get(&uri)).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["reason"], "already_accessed");
}

#[tokio::test]
async fn missing_token_is_bad_request() {
    let t = app(None);
    for uri in ["/links", "/links?token=", "/links?token=%20%20"] {
        let (status, body) = send(&t.router, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "uri {uri}");
        assert_eq!(body["reason"], "invalid_request");
    }
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let t = app(None);
    let (status, body) = send(
        &t.router,
        get("/links/6f1c2d3e-4b5a-4978-8a6b-0c1d2e3f4a5b"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_found");
}

#[tokio::test]
async fn invalid_create_requests_are_rejected() {
    let t = app(None);
    let cases = [
        json!({"content": "", "expiresInMinutes": 5}),
        json!({"content": "x", "expiresInMinutes": 0}),
        json!({"content": "x", "expiresInMinutes": -3}),
        json!({"content": "x", "expiresInMinutes": 10081}),
        json!({"content": "x"}),
        json!({"expiresInMinutes": 5}),
        json!({"content": "x", "expiresInMinutes": "five"}),
    ];
    for case in cases {
        let (status, body) = send(&t.router, post_json("/links", case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {case}");
        assert_eq!(body["reason"], "invalid_request", "case {case}");
    }

    let malformed = Request::builder()
        .method("POST")
        .uri("/links")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&t.router, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "invalid_request");
}

#[tokio::test]
async fn oversized_content_is_rejected() {
    let t = app(None);
    let content = "a".repeat(IssuePolicy::default().max_content_bytes + 1);
    let (status, body) = send(
        &t.router,
        post_json("/links", json!({"content": content, "expiresInMinutes": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "invalid_request");
}

#[tokio::test]
async fn expired_link_is_gone() {
    let t = app(None);
    let now = now_millis();
    let token = crypto::generate_access_token();
    let payload = crypto::seal(b"too late").unwrap();
    t.state
        .store
        .insert(NewSecret {
            access_token: token.clone(),
            encrypted_payload: payload,
            created_at: now - 120_000,
            expires_at: now - 60_000,
        })
        .unwrap();

    let (status, body) = send(&t.router, get(&format!("/links/{token}"))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["reason"], "expired");
}

#[tokio::test]
async fn corrupt_payload_is_server_error_and_spends_link() {
    let t = app(None);
    let now = now_millis();
    let token = crypto::generate_access_token();
    t.state
        .store
        .insert(NewSecret {
            access_token: token.clone(),
            encrypted_payload: vec![0u8; 10],
            created_at: now,
            expires_at: now + 60_000,
        })
        .unwrap();

    let uri = format!("/links/{token}");
    let (status, body) = send(&t.router, get(&uri)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["reason"], "server_error");

    let (status, body) = send(&t.router, get(&uri)).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["reason"], "already_accessed");
}

#[tokio::test]
async fn admin_endpoints_disabled_without_token() {
    let t = app(None);
    let (status, _) = send(&t.router, get("/audit")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("POST")
        .uri("/prune")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_endpoints_require_bearer_token() {
    let t = app(Some(ADMIN_TOKEN));

    let (status, _) = send(&t.router, get("/audit")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/audit")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.router, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn audit_trail_records_link_lifecycle() {
    let t = app(Some(ADMIN_TOKEN));
    let created = create(&t.router, "audited", 5).await;
    let uri = format!("/links/{}", created.access_token);
    send(&t.router, get(&uri)).await;
    send(&t.router, get(&uri)).await;
    send(&t.router, get("/links/0e9d8c7b-6a5f-4e3d-9c2b-1a0f9e8d7c6b")).await;

    let admin_get = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&t.router, admin_get("/audit?event=link.redeem")).await;
    assert_eq!(status, StatusCode::OK);
    let outcomes: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, ["not_found", "already_accessed", "ok"]);

    let record_id = body["entries"][1]["record_id"].as_str().unwrap().to_owned();
    let trail_uri = format!("/audit?record={record_id}");
    let (status, trail) = send(&t.router, admin_get(trail_uri.as_str())).await;
    assert_eq!(status, StatusCode::OK);
    let trail = trail["entries"].as_array().unwrap();
    let events: Vec<&str> = trail.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(events, ["link.redeem", "link.redeem", "link.create"]);
    assert!(trail.iter().all(|e| e["source_ip"] == "127.0.0.1"));

    let now = now_millis();
    let future_uri = format!("/audit?since={}", now + 60_000);
    let (_, future) = send(&t.router, admin_get(future_uri.as_str())).await;
    assert!(future["entries"].as_array().unwrap().is_empty());

    let body = serde_json::to_string(&body).unwrap();
    assert!(!body.contains(&created.access_token));
    assert!(!body.contains("audited"));
}

#[tokio::test]
async fn prune_removes_expired_links() {
    let t = app(Some(ADMIN_TOKEN));
    let now = now_millis();
    for offset in [-60_000, -1, 60_000] {
        t.state
            .store
            .insert(NewSecret {
                access_token: crypto::generate_access_token(),
                encrypted_payload: crypto::seal(b"x").unwrap(),
                created_at: now - 120_000,
                expires_at: now + offset,
            })
            .unwrap();
    }

    let request = Request::builder()
        .method("POST")
        .uri("/prune")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&t.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pruned"], 2);
    assert_eq!(t.state.store.len().unwrap(), 1);
}

#[tokio::test]
async fn cors_preflight_allows_browser_clients() {
    let t = app(None);
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/links")
        .header(header::ORIGIN, "https://app.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(
            header::ACCESS_CONTROL_REQUEST_HEADERS,
            "content-type,x-client-info",
        )
        .body(Body::empty())
        .unwrap();
    let response = t.router.clone().oneshot(request).await.unwrap();
    assert!(response.status().is_success());

    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    let allowed = headers
        .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_ascii_lowercase();
    for name in ["authorization", "content-type", "x-client-info", "apikey"] {
        assert!(allowed.contains(name), "missing {name} in {allowed}");
    }
}
