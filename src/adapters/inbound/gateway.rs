//! Gateway
//!
//! HTTP entry point for clients and operators. Identifies the client by
//! address and session cookie, drives the lifecycle manager, and answers
//! with redirects or JSON.

use crate::application::{LifecycleManager, PollStatus, ResolveState};
use crate::domain::entities::InstanceRecord;
use crate::domain::errors::{LifecycleError, ProviderError};
use crate::domain::value_objects::{normalize_address, SessionId};
use crate::infrastructure::{RateLimitResult, RateLimiter, ShutdownController};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const SESSION_COOKIE: &str = "session_id";
const SESSION_COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Gateway state shared by all handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<LifecycleManager>,
    pub limiter: Arc<RateLimiter>,
    /// Admin API is disabled when unset
    pub admin_key: Option<String>,
}

impl GatewayState {
    pub fn new(
        manager: Arc<LifecycleManager>,
        limiter: Arc<RateLimiter>,
        admin_key: Option<String>,
    ) -> Self {
        Self {
            manager,
            limiter,
            admin_key,
        }
    }
}

/// Errors rendered as JSON responses.
#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    BadRequest(String),
    Unauthorized,
    AdminDisabled,
    RateLimited { retry_after_secs: u64 },
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Lifecycle(e) => match e {
                LifecycleError::NotFound(_)
                | LifecycleError::InstanceNotFound(_)
                | LifecycleError::InvalidApplication(_)
                | LifecycleError::Provider(ProviderError::NotFound(_)) => StatusCode::NOT_FOUND,
                LifecycleError::Conflict { .. } => StatusCode::CONFLICT,
                LifecycleError::ProvisionFailed { .. } | LifecycleError::Provider(_) => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::AdminDisabled => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Lifecycle(e) => e.to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::Unauthorized => "invalid admin key".to_string(),
            Self::AdminDisabled => "admin API disabled".to_string(),
            Self::RateLimited { .. } => "too many requests".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.message());
        }
        let body = Json(serde_json::json!({ "error": self.message() }));
        match self {
            Self::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

// ===== Request/response types =====

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SwitchQuery {
    #[serde(rename = "oldSession")]
    pub old_session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// A tracked session as shown to operators.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub application: String,
    pub instance_id: Option<u64>,
    pub address: String,
    pub port: u16,
    pub owner_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: i64,
}

impl SessionView {
    fn new(session_id: SessionId, record: InstanceRecord, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            expires_in_secs: (record.expires_at - now).num_seconds().max(0),
            application: record.application,
            instance_id: record.instance_id,
            address: record.address,
            port: record.port,
            owner_address: record.owner_address,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionView>,
    pub addresses: BTreeMap<String, SessionId>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub public_ip: Option<String>,
    pub region: Option<String>,
    pub size: Option<String>,
    pub created_at: Option<String>,
    pub session: Option<SessionView>,
}

#[derive(Debug, Serialize)]
pub struct InstancesResponse {
    pub instances: Vec<InstanceView>,
    pub total: usize,
}

// ===== Server =====

/// HTTP gateway.
pub struct Gateway {
    listen_addr: String,
    state: GatewayState,
}

impl Gateway {
    pub fn new(listen_addr: String, state: GatewayState) -> Self {
        Self { listen_addr, state }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown` fires, then finish in-flight requests.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("gateway listening on {}", self.listen_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

        tracing::info!("gateway stopped");
        Ok(())
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status/:session_id", get(status_handler))
        .route("/switch/:app", get(switch_handler))
        .route("/admin/api/instances", get(admin_instances_handler))
        .route("/admin/api/sessions", get(admin_sessions_handler))
        .route("/admin/api/instances/:id", delete(admin_delete_handler))
        .route("/admin/api/instances/:id/reboot", post(admin_reboot_handler))
        .route(
            "/admin/api/instances/:id/refresh-ttl",
            post(admin_refresh_handler),
        )
        .route("/:app", get(resolve_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===== Client identity =====

/// First `X-Forwarded-For` hop, else the socket peer; normalized.
fn client_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(normalize_address)
        .unwrap_or_else(|| normalize_address(&peer.ip().to_string()))
}

/// Session from the cookie, else the `session` query parameter.
fn client_session(headers: &HeaderMap, query: &SessionQuery) -> Option<SessionId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .or_else(|| query.session.clone())
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
}

fn session_cookie(session_id: &SessionId) -> HeaderValue {
    let cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE, session_id, SESSION_COOKIE_MAX_AGE_SECS
    );
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn throttle(state: &GatewayState, address: &str) -> Result<(), ApiError> {
    match state.limiter.check(address) {
        RateLimitResult::Allowed { .. } => Ok(()),
        RateLimitResult::Limited { retry_after_ms } => {
            tracing::debug!("rate limited {}", address);
            Err(ApiError::RateLimited {
                retry_after_secs: retry_after_ms.div_ceil(1000).max(1),
            })
        }
    }
}

fn authorize(state: &GatewayState, query: &AdminQuery) -> Result<(), ApiError> {
    let Some(expected) = &state.admin_key else {
        return Err(ApiError::AdminDisabled);
    };
    match &query.key {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn status_url(session_id: &SessionId) -> String {
    format!("/status/{}", session_id)
}

// ===== Client handlers =====

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.manager.registry().len(),
    })
}

async fn resolve_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(app): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let address = client_address(&headers, peer);
    throttle(&state, &address)?;
    let session = client_session(&headers, &query);

    let resolution = state
        .manager
        .resolve(&address, session.as_ref(), &app)
        .await?;
    let cookie = session_cookie(&resolution.session_id);

    let response = match resolution.state {
        ResolveState::Ready => match resolution.record.redirect_target() {
            Some(target) => {
                tracing::debug!("redirecting {} to {}", address, target);
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, target)],
                    [(header::SET_COOKIE, cookie)],
                )
                    .into_response()
            }
            None => pending_response(&resolution.session_id, cookie),
        },
        ResolveState::Pending => pending_response(&resolution.session_id, cookie),
        ResolveState::Conflict => (
            StatusCode::CONFLICT,
            [(header::SET_COOKIE, cookie)],
            Json(serde_json::json!({
                "status": "conflict",
                "session_id": resolution.session_id,
                "current_application": resolution.record.application,
                "requested_application": app,
                "switch_url": format!("/switch/{}?oldSession={}", app, resolution.session_id),
            })),
        )
            .into_response(),
    };
    Ok(response)
}

fn pending_response(session_id: &SessionId, cookie: HeaderValue) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({
            "status": "pending",
            "session_id": session_id,
            "status_url": status_url(session_id),
            "message": "Your instance is being prepared",
        })),
    )
        .into_response()
}

async fn status_handler(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let session_id = SessionId::from(session_id);
    match state.manager.poll_status(&session_id).await {
        PollStatus::Ready {
            address,
            port,
            delay_hint,
        } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ready": true,
                "url": format!("http://{}:{}", address, port),
                "address": address,
                "port": port,
                "delay_hint_ms": delay_hint.as_millis() as u64,
            })),
        ),
        PollStatus::Pending { message } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ready": false,
                "message": message,
            })),
        ),
        PollStatus::NotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "ready": false,
                "message": "Session not found or expired",
            })),
        ),
        PollStatus::ProviderError { message } => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "ready": false,
                "error": message,
            })),
        ),
    }
}

async fn switch_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(app): Path<String>,
    Query(query): Query<SwitchQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let old_session = query
        .old_session
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
        .ok_or_else(|| ApiError::BadRequest("missing oldSession parameter".to_string()))?;

    let address = client_address(&headers, peer);
    throttle(&state, &address)?;

    let outcome = state
        .manager
        .switch_application(&old_session, &app, &address)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        [(header::SET_COOKIE, session_cookie(&outcome.session_id))],
        Json(serde_json::json!({
            "status": "pending",
            "session_id": outcome.session_id,
            "application": outcome.record.application,
            "status_url": status_url(&outcome.session_id),
        })),
    )
        .into_response())
}

// ===== Admin handlers =====

async fn admin_sessions_handler(
    State(state): State<GatewayState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    authorize(&state, &query)?;

    let now = state.manager.now();
    let sessions: Vec<SessionView> = state
        .manager
        .list_all()
        .into_iter()
        .map(|(session_id, record)| SessionView::new(session_id, record, now))
        .collect();
    let addresses = state.manager.registry().address_map().into_iter().collect();

    Ok(Json(SessionsResponse {
        total: sessions.len(),
        sessions,
        addresses,
    }))
}

async fn admin_instances_handler(
    State(state): State<GatewayState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<InstancesResponse>, ApiError> {
    authorize(&state, &query)?;

    let now = state.manager.now();
    let instances: Vec<InstanceView> = state
        .manager
        .list_instances()
        .await?
        .into_iter()
        .map(|managed| {
            let instance = managed.instance;
            InstanceView {
                id: instance.id,
                public_ip: instance.public_address().map(str::to_string),
                name: instance.name,
                status: instance.status.to_string(),
                region: instance.region,
                size: instance.size,
                created_at: instance.created_at,
                session: managed
                    .session
                    .map(|(session_id, record)| SessionView::new(session_id, record, now)),
            }
        })
        .collect();

    Ok(Json(InstancesResponse {
        total: instances.len(),
        instances,
    }))
}

async fn admin_delete_handler(
    State(state): State<GatewayState>,
    Path(id): Path<u64>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &query)?;

    let deletion = state.manager.delete_by_instance_id(id).await;
    Ok(Json(serde_json::json!({
        "id": id,
        "deleted": deletion.provider_deleted,
        "session_id": deletion.session_id,
    })))
}

async fn admin_reboot_handler(
    State(state): State<GatewayState>,
    Path(id): Path<u64>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &query)?;

    state.manager.reboot_by_instance_id(id).await?;
    Ok(Json(serde_json::json!({
        "id": id,
        "rebooted": true,
    })))
}

async fn admin_refresh_handler(
    State(state): State<GatewayState>,
    Path(id): Path<u64>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &query)?;

    let expires_at = state.manager.refresh_by_instance_id(id)?;
    Ok(Json(serde_json::json!({
        "id": id,
        "expires_at": expires_at,
    })))
}
