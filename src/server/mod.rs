// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! HTTP service
//!
//! Exposes the auth core to the catalog and editor pages.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/auth/status` - Auth state for the caller
//! - `POST /api/auth/login` - Sign in, sets the `atlas_session` cookie
//! - `POST /api/auth/logout` - Sign out (session token required)
//! - `GET /api/guard?path=` - Guard decision for single-page clients
//! - `GET /api/security/{events,stats,export,stream}` - Operator endpoints
//! - `DELETE /api/images/{public_id}` - Image delete proxy
//! - any other `GET` - Guarded page shell
//!
//! Requests authenticate with the session token, either from the cookie or
//! as `Authorization: Bearer <token>`.
//!
//! # Example
//!
//! ```no_run
//! use atlas_guard::{AtlasConfig, AtlasContext};
//! use atlas_guard::server::Server;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = Arc::new(AtlasContext::from_config(AtlasConfig::default())?);
//! ctx.initialize();
//! Server::new(ctx).start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Json, Redirect, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures_util::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::timeout::TimeoutLayer;

use crate::context::AtlasContext;
use crate::directory::UserRecord;
use crate::errors::UserError;
use crate::media::{CloudinaryClient, DestroyOutcome, MediaError, MediaHost};
use crate::security::{AuthError, AuthState, GuardDecision, SecurityEvent};

pub const SESSION_COOKIE: &str = "atlas_session";

// Login bodies are tiny
const MAX_BODY_SIZE: usize = 16 * 1024;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const PENDING_RETRY_SECS: u64 = 1;

/// Server state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AtlasContext>,
    pub media: Option<Arc<dyn MediaHost>>,
}

pub struct Server {
    ctx: Arc<AtlasContext>,
    port: u16,
    /// Defaults to 127.0.0.1.
    bind_address: String,
    requests_per_second: u64,
    burst: u32,
    media: Option<Arc<dyn MediaHost>>,
}

impl Server {
    /// Server settings and media host come from the context's configuration.
    pub fn new(ctx: Arc<AtlasContext>) -> Self {
        let server = &ctx.config.server;
        let media = ctx
            .config
            .media
            .clone()
            .map(|config| Arc::new(CloudinaryClient::new(config)) as Arc<dyn MediaHost>);
        Self {
            port: server.port,
            bind_address: server.bind_address.clone(),
            requests_per_second: server.requests_per_second,
            burst: server.burst,
            media,
            ctx,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use "0.0.0.0" to allow network access.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaHost>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Router without rate limiting, which needs the peer address.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            ctx: Arc::clone(&self.ctx),
            media: self.media.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/api/auth/status", get(status_handler))
            .route("/api/auth/login", post(login_handler))
            .route("/api/auth/logout", post(logout_handler))
            .route("/api/guard", get(guard_handler))
            .route("/api/security/events", get(events_handler))
            .route("/api/security/stats", get(stats_handler))
            .route("/api/security/export", get(export_handler))
            .route("/api/security/stream", get(stream_handler))
            .route("/api/images/*public_id", delete(delete_image_handler))
            .fallback(page_handler)
            .layer(
                ServiceBuilder::new()
                    .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
                    .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS))),
            )
            .with_state(state)
    }

    /// Serve until SIGINT/SIGTERM. Background tasks run for the lifetime of
    /// the server.
    pub async fn start(&self) -> Result<()> {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(self.requests_per_second.max(1))
                .burst_size(self.burst.max(1))
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?,
        );
        let router = self.build_router().layer(GovernorLayer {
            config: governor_conf,
        });

        let addr = format!("{}:{}", self.bind_address, self.port);
        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the editor to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another atlas server may be running; \
                    stop it or choose a different port with --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        let tasks = self.ctx.start_background_tasks();

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tasks.shutdown().await;
        tracing::info!("Server stopped");
        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    auth_state: AuthState,
}

#[derive(Serialize)]
struct StatusResponse {
    state: AuthState,
    authenticated: bool,
    loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserRecord>,
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    authenticated: bool,
    user: UserRecord,
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Deserialize)]
struct GuardQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct DeleteImageResponse {
    message: &'static str,
    result: DestroyOutcome,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        auth_state: state.ctx.auth.state(),
    })
}

/// Only a caller presenting the stored token is reported as authenticated.
async fn status_handler(State(state): State<AppState>, headers: HeaderMap) -> Json<StatusResponse> {
    let auth = &state.ctx.auth;
    let holds = presented_token(&headers).is_some_and(|t| auth.holds_token(&t));
    let authenticated = holds && state.ctx.check_auth_status();

    Json(StatusResponse {
        state: auth.state(),
        authenticated,
        loading: auth.is_loading(),
        user: if authenticated { auth.current_user() } else { None },
    })
}

async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, UserError> {
    let auth = &state.ctx.auth;
    let record = auth.try_login(&request.username, &request.password).await?;
    let expires_at = record.created_at + auth.sessions().timeout();

    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE,
        record.token,
        auth.sessions().timeout().num_seconds()
    );

    let body = Json(LoginResponse {
        authenticated: true,
        user: record.user,
        token: record.token,
        expires_at,
    });
    Ok(with_cookie(body.into_response(), &cookie))
}

async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, UserError> {
    let auth = &state.ctx.auth;
    match presented_token(&headers) {
        Some(token) if auth.holds_token(&token) => {}
        _ => {
            return Err(UserError::authentication_required(
                "Please sign in.",
                Some("logout without the session token"),
            ))
        }
    }
    auth.logout();

    let cookie = format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", SESSION_COOKIE);
    let body = Json(serde_json::json!({ "authenticated": false }));
    Ok(with_cookie(body.into_response(), &cookie))
}

async fn guard_handler(
    State(state): State<AppState>,
    Query(query): Query<GuardQuery>,
    headers: HeaderMap,
) -> Result<Json<GuardDecision>, UserError> {
    let path = query
        .path
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| UserError::invalid_request("An absolute path is required.", Some("path")))?;
    let token = presented_token(&headers);
    Ok(Json(state.ctx.guard.evaluate_request(&path, token.as_deref())))
}

/// Guarded page shell. Rendering the page itself is up to the client.
async fn page_handler(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path();
    let token = presented_token(&headers);

    match state.ctx.guard.evaluate_request(path, token.as_deref()) {
        GuardDecision::Allow { path } => Html(page_shell(&path)).into_response(),
        GuardDecision::Redirect {
            to,
            reason,
            attempted_path,
            ..
        } => Redirect::to(&redirect_location(&to, reason.as_str(), &attempted_path)).into_response(),
        GuardDecision::Pending { .. } => {
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, "Checking session...").into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(PENDING_RETRY_SECS));
            response
        }
    }
}

async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<SecurityEvent>>, UserError> {
    require_session(&state.ctx, &headers)?;
    let limit = query
        .limit
        .unwrap_or(state.ctx.config.security.log_capacity);
    Ok(Json(state.ctx.events.recent(limit)))
}

async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, UserError> {
    require_session(&state.ctx, &headers)?;
    Ok(Json(state.ctx.events.stats()).into_response())
}

async fn export_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, UserError> {
    require_session(&state.ctx, &headers)?;
    let body = state.ctx.events.export()?;
    let filename = format!(
        "security-log-{}.json",
        state.ctx.clock.now().format("%Y-%m-%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response())
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, UserError> {
    require_session(&state.ctx, &headers)?;

    // Lagged receivers skip what they missed.
    let stream = BroadcastStream::new(state.ctx.events.subscribe()).filter_map(|item| {
        future::ready(item.ok().and_then(|event| {
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default()
                .event(event.kind.as_str())
                .id(event.id)
                .data(data)))
        }))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn delete_image_handler(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteImageResponse>, UserError> {
    require_session(&state.ctx, &headers)?;

    let public_id = public_id.trim_matches('/');
    if public_id.is_empty() {
        return Err(UserError::invalid_request("An image id is required.", Some("public_id")));
    }

    let media = state.media.as_ref().ok_or(MediaError::NotConfigured)?;
    let result = media.destroy(public_id).await?;
    if result == DestroyOutcome::NotFound {
        tracing::info!(target: "atlas::media", public_id = %public_id, "Image already absent");
    }
    Ok(Json(DeleteImageResponse {
        message: "Image deleted",
        result,
    }))
}

// =============================================================================
// Helpers
// =============================================================================

/// Session token from the `atlas_session` cookie or a bearer header.
fn presented_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            pair.trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        });

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

/// The caller must present the stored token and the session must still pass
/// its expiry and integrity checks.
fn require_session(ctx: &AtlasContext, headers: &HeaderMap) -> Result<(), UserError> {
    let Some(token) = presented_token(headers) else {
        return Err(UserError::authentication_required(
            "Please sign in.",
            Some("no session token presented"),
        ));
    };
    if !ctx.auth.holds_token(&token) {
        return Err(UserError::authentication_required(
            "Please sign in.",
            Some("presented token does not match the stored session"),
        ));
    }
    let verdict = ctx.verify_session();
    if !verdict.is_valid() {
        return Err(AuthError::SessionInvalid(verdict).into());
    }
    Ok(())
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// `{to}?reason=..&from=..`, query values percent-encoded.
fn redirect_location(to: &str, reason: &str, from: &str) -> String {
    match reqwest::Url::parse_with_params("http://atlas.invalid/", &[("reason", reason), ("from", from)]) {
        Ok(url) => format!("{}?{}", to, url.query().unwrap_or_default()),
        Err(_) => to.to_string(),
    }
}

fn page_shell(path: &str) -> String {
    let escaped = path
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    format!(
        "<!doctype html>\n<html lang=\"es\">\n<head><meta charset=\"utf-8\"><title>Atlas</title></head>\n<body data-path=\"{}\"><div id=\"root\"></div></body>\n</html>\n",
        escaped
    )
}

/// Waits for SIGINT/SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!("Failed to listen for Ctrl+C: {}", e);
                        }
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
