//! HTTP surface of the gateway.
//!
//! Route map (tiering enforced by the auth layers, §auth::gate):
//!
//! ```text
//! GET  /health              public    liveness probe
//! GET  /status              public    agent up/down (find-only, never starts)
//! ANY  /api/agent/{*path}   identity  reverse proxy to the agent process
//! POST /api/restart         identity  kill + fresh start
//! GET  /api/logs            identity  agent stdout/stderr
//! GET  /api/whoami          identity  admitted identity claims
//! GET  /debug/processes     identity+ raw process table (404 unless enabled)
//! GET  /debug/config        identity+ redacted config snapshot
//! ANY  /cdp[/{*path}]       secret    remote-debugging bridge proxy
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::HeaderName;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router, middleware};
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{
    DEBUG_SECRET_PARAM, IdentityClaims, TokenVerifier, debug_bridge_layer, identity_layer,
};
use crate::config::{BypassConfig, GatewayConfig};
use crate::error::GatewayError;
use crate::supervisor::Supervisor;

const MAX_PROXY_BODY_BYTES: usize = 10 * 1024 * 1024;

static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Shared state for all handlers and auth layers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub verifier: Arc<TokenVerifier>,
    pub config: Arc<GatewayConfig>,
    pub http: reqwest::Client,
    /// Tests pin the bypass flags here; production leaves it `None` and the
    /// flags are re-read from the environment on every request.
    pub bypass_override: Option<BypassConfig>,
}

impl AppState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        verifier: Arc<TokenVerifier>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            supervisor,
            verifier,
            config,
            http: reqwest::Client::new(),
            bypass_override: None,
        }
    }

    /// Current bypass flags, snapshotted per request.
    pub fn bypass(&self) -> BypassConfig {
        self.bypass_override.unwrap_or_else(BypassConfig::from_env)
    }
}

/// Build the full router with tier layers applied.
pub fn router(state: AppState) -> Router {
    let identity_routes = Router::new()
        .route("/api/agent/{*path}", any(proxy_agent))
        .route("/api/restart", post(restart_agent))
        .route("/api/logs", get(agent_logs))
        .route("/api/whoami", get(whoami))
        .route("/debug/processes", get(debug_processes))
        .route("/debug/config", get(debug_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            identity_layer,
        ))
        .with_state(state.clone());

    let bridge_routes = Router::new()
        .route("/cdp", any(proxy_devtools))
        .route("/cdp/{*path}", any(proxy_devtools))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            debug_bridge_layer,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
        .merge(identity_routes)
        .merge(bridge_routes)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve in the foreground. Used by `main`.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

/// Bind on `addr`, spawn the server, and return the bound address. Used by
/// integration tests (bind to port 0 for an ephemeral port).
pub async fn start(addr: SocketAddr, state: AppState) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!(error = %e, "gateway server exited");
        }
    });
    Ok(bound)
}

// -- Public tier --

async fn health() -> &'static str {
    "ok"
}

/// Agent up/down without side effects: a find-only lookup that never
/// triggers a start and treats lookup failure as "not running".
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.supervisor.find_running().await.is_some();
    Json(json!({ "status": "ok", "agent_running": running }))
}

// -- Identity tier --

async fn whoami(Extension(claims): Extension<IdentityClaims>) -> Json<IdentityClaims> {
    Json(claims)
}

async fn restart_agent(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let record = state.supervisor.restart().await?;
    tracing::info!(process_id = %record.id, "agent restarted");
    Ok(Json(record).into_response())
}

async fn agent_logs(State(state): State<AppState>) -> Result<Response, GatewayError> {
    match state.supervisor.agent_logs().await {
        Some(logs) => Ok(Json(logs).into_response()),
        None => Err(GatewayError::NotFound),
    }
}

async fn proxy_agent(State(state): State<AppState>, request: Request) -> Result<Response, GatewayError> {
    state.supervisor.ensure_running().await?;
    let path = request
        .uri()
        .path()
        .strip_prefix("/api/agent")
        .unwrap_or("/")
        .to_string();
    let query = request.uri().query().map(str::to_string);
    forward(&state, state.config.agent.port, &path, query, request).await
}

/// Raw process table. Reaching this handler means the gate already ran:
/// diagnostics enabled and identity admitted.
async fn debug_processes(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let records = state
        .supervisor
        .sandbox()
        .list_processes()
        .await
        .map_err(crate::error::SupervisorError::from_sandbox)?;
    Ok(Json(records).into_response())
}

/// Redacted config snapshot: which knobs are set, never their values.
async fn debug_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.config;
    let bypass = state.bypass();
    Json(json!({
        "agent_port": config.agent.port,
        "devtools_port": config.agent.devtools_port,
        "debug_secret_configured": config.debug_secret.is_some(),
        "access_audience": config.access.audience,
        "dev_bypass": bypass.dev_bypass,
        "e2e_bypass": bypass.e2e_bypass,
    }))
}

// -- Shared-secret tier --

async fn proxy_devtools(State(state): State<AppState>, request: Request) -> Result<Response, GatewayError> {
    state.supervisor.ensure_running().await?;
    let path = request
        .uri()
        .path()
        .strip_prefix("/cdp")
        .unwrap_or("/")
        .to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };
    // The bridge credential is meaningless upstream; strip it here. Agent
    // proxy traffic is forwarded with its query untouched.
    let query = scrub_query(request.uri().query());
    forward(&state, state.config.agent.devtools_port, &path, query, request).await
}

// -- Proxy plumbing --

/// Forward a request to the agent at `port` inside the sandbox, relaying
/// method, body, and headers (hop-by-hop and credential headers stripped).
/// `query` is a raw, still-percent-encoded query string appended verbatim
/// so forwarded values are never re-encoded.
async fn forward(
    state: &AppState,
    port: u16,
    path: &str,
    query: Option<String>,
    request: Request,
) -> Result<Response, GatewayError> {
    let mut upstream = format!(
        "http://{}:{}{}",
        sandbox_host(&state.config.sandbox_url),
        port,
        path
    );
    if let Some(query) = &query {
        upstream.push('?');
        upstream.push_str(query);
    }

    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = body::to_bytes(request.into_body(), MAX_PROXY_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::Upstream(format!("request body: {e}")))?;

    let request_id = headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::debug!(%method, upstream = %upstream, request_id = %request_id, "proxying to agent");

    let mut builder = state.http.request(method, &upstream);
    for (name, value) in headers.iter() {
        if name == &HOST
            || name == &CONTENT_LENGTH
            || name == &CONNECTION
            || name == &TRANSFER_ENCODING
            || name.as_str() == crate::auth::ASSERTION_HEADER
        {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder = builder.header(REQUEST_ID_HEADER.clone(), request_id.clone());

    let upstream_response = builder
        .body(body)
        .send()
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

    let status = upstream_response.status();
    let mut response = Response::builder().status(status);
    for (name, value) in upstream_response.headers().iter() {
        if name == &CONNECTION || name == &TRANSFER_ENCODING || name == &CONTENT_LENGTH {
            continue;
        }
        response = response.header(name.clone(), value.clone());
    }
    let bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;
    response
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::Upstream(e.to_string()))
}

/// Host part of the sandbox control URL; the agent's ports are exposed on
/// the same host.
fn sandbox_host(sandbox_url: &str) -> &str {
    let without_scheme = sandbox_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(sandbox_url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port)
}

/// Bridge query string with the `secret` pair removed. The surviving pairs
/// are kept verbatim, still percent-encoded, so they can be appended to the
/// upstream URL without another round of encoding.
fn scrub_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
            key != DEBUG_SECRET_PARAM
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}
