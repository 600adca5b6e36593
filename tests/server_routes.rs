// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! HTTP routes exercised through the router without a listener.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use atlas_guard::media::{DestroyOutcome, MediaError, MediaHost};
use atlas_guard::security::password::hash_password;
use atlas_guard::security::SessionSecret;
use atlas_guard::server::Server;
use atlas_guard::{
    AtlasConfig, AtlasContext, ManualClock, MemoryStore, SecurityEventKind, StaticDirectory,
    StoredUser,
};

struct FakeMedia;

#[async_trait]
impl MediaHost for FakeMedia {
    async fn destroy(&self, public_id: &str) -> Result<DestroyOutcome, MediaError> {
        match public_id {
            "placas/missing" => Ok(DestroyOutcome::NotFound),
            "placas/broken" => Err(MediaError::Rejected("Invalid Signature".to_string())),
            _ => Ok(DestroyOutcome::Deleted),
        }
    }
}

fn context() -> Arc<AtlasContext> {
    context_with_clock(ManualClock::default())
}

fn context_with_clock(clock: ManualClock) -> Arc<AtlasContext> {
    let directory = StaticDirectory::new(vec![StoredUser {
        id: "1".to_string(),
        username: "admin".to_string(),
        password_hash: hash_password("correct-pass").unwrap(),
    }]);
    Arc::new(AtlasContext::with_parts(
        AtlasConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(clock),
        Arc::new(directory),
        SessionSecret::new(b"routes".to_vec()),
    ))
}

fn router(ctx: &Arc<AtlasContext>) -> Router {
    Server::new(Arc::clone(ctx))
        .with_media(Arc::new(FakeMedia))
        .build_router()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::COOKIE, format!("atlas_session={}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn login_request(username: &str, password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username, "password": password }).to_string(),
        ))
        .unwrap()
}

async fn login(router: &Router) -> String {
    let (status, headers, body) = send(router, login_request("admin", "correct-pass")).await;
    assert_eq!(status, StatusCode::OK);

    let cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("atlas_session=sess_"));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["authenticated"], true);
    assert_eq!(json["user"]["username"], "admin");
    json["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let ctx = context();
    ctx.initialize();
    let (status, _, body) = send(&router(&ctx), get("/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["auth_state"], "unauthenticated");
}

#[tokio::test]
async fn test_protected_page_redirects_without_session() {
    let ctx = context();
    ctx.initialize();
    let (status, headers, _) = send(&router(&ctx), get("/placas", None)).await;

    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        headers[header::LOCATION],
        "/?reason=login_required&from=%2Fplacas"
    );
}

#[tokio::test]
async fn test_public_page_renders() {
    let ctx = context();
    ctx.initialize();
    let (status, _, body) = send(&router(&ctx), get("/home", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("data-path=\"/home\""));
}

#[tokio::test]
async fn test_page_pending_before_initialize() {
    let ctx = context();
    let (status, headers, _) = send(&router(&ctx), get("/edicion", None)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn test_login_grants_protected_pages() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);
    let token = login(&router).await;

    let (status, _, _) = send(&router, get("/edicion/3", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&router, get("/edicion/3", Some("sess_forged"))).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_bad_credentials_are_generic() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);

    let (status, _, wrong_pass) = send(&router, login_request("admin", "wrong-pass")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, no_user) = send(&router, login_request("nobody", "wrong-pass")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let a: Value = serde_json::from_slice(&wrong_pass).unwrap();
    let b: Value = serde_json::from_slice(&no_user).unwrap();
    assert_eq!(a["error"]["message"], b["error"]["message"]);
    assert_eq!(a["error"]["error_type"], "authentication_required");
}

#[tokio::test]
async fn test_lockout_returns_429() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);

    for _ in 0..5 {
        send(&router, login_request("admin", "wrong-pass")).await;
    }
    let (status, _, body) = send(&router, login_request("admin", "correct-pass")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(!String::from_utf8(body).unwrap().contains("minute"));
}

#[tokio::test]
async fn test_guard_endpoint() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);

    let (status, _, body) = send(&router, get("/api/guard?path=/temario", None)).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["decision"], "redirect");
    assert_eq!(json["reason"], "login_required");

    let (status, _, _) = send(&router, get("/api/guard", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_operator_endpoints_require_session() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);

    let (status, _, _) = send(&router, get("/api/security/events", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    send(&router, get("/placas", None)).await;
    let token = login(&router).await;

    let (status, _, body) = send(&router, get("/api/security/events?limit=5", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let events: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(events[0]["kind"], "unauthorized_attempt");

    let (status, _, body) = send(&router, get("/api/security/stats", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["unauthorized_attempts"], 1);

    let (status, headers, _) = send(&router, get("/api/security/export", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment"));
}

#[tokio::test]
async fn test_delete_image() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);

    let delete = |uri: &str, token: Option<&str>| {
        let mut builder = Request::builder().method("DELETE").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    };

    let (status, _, _) = send(&router, delete("/api/images/placas/ok", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login(&router).await;

    let (status, _, body) = send(&router, delete("/api/images/placas/ok", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["result"], "deleted");

    let (status, _, _) = send(&router, delete("/api/images/placas/missing", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&router, delete("/api/images/placas/broken", Some(&token))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"]["message"].is_string());
    assert_eq!(json["error"]["error"], "Invalid Signature");
}

#[tokio::test]
async fn test_logout_ends_session() {
    let ctx = context();
    ctx.initialize();
    let router = router(&ctx);
    let token = login(&router).await;

    let logout = |token: Option<&str>| {
        let mut builder = Request::builder().method("POST").uri("/api/auth/logout");
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, format!("atlas_session={}", token));
        }
        builder.body(Body::empty()).unwrap()
    };

    let (status, _, _) = send(&router, logout(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(ctx.auth.is_authenticated());

    let (status, headers, _) = send(&router, logout(Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));
    assert!(!ctx.auth.is_authenticated());

    let (status, _, body) = send(&router, get("/api/auth/status", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["authenticated"], false);

    let (status, _, _) = send(&router, get("/edicion", Some(&token))).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_expired_token_on_operator_endpoint_records_anomaly() {
    let clock = ManualClock::default();
    let ctx = context_with_clock(clock.clone());
    ctx.initialize();
    let router = router(&ctx);
    let token = login(&router).await;

    clock.advance(chrono::Duration::hours(9));
    let (status, _, body) = send(&router, get("/api/security/stats", Some(&token))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["error_type"], "session_expired");
    assert!(!ctx.auth.is_authenticated());
    let anomalies = ctx
        .events
        .recent(usize::MAX)
        .iter()
        .filter(|e| e.kind == SecurityEventKind::SessionAnomaly)
        .count();
    assert_eq!(anomalies, 1);
}
