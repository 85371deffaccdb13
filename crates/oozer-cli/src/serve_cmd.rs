//! `oozer serve`: the operator REST API plus the WebSocket observer
//! endpoint.
//!
//! Handlers stay thin: state transitions, task operations, and plan
//! creation all live in `oozer-core`; this module maps their results onto
//! HTTP statuses (409 for illegal transitions) and wires the event bus to
//! connected observers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use oozer_db::models::{Plan, PlanStatus, Role, Task, TaskStatus, User};
use oozer_db::queries::tasks::PlanProgress;
use oozer_db::queries::{plans as plan_db, tasks as task_db, users as user_db};

use oozer_core::auth::{self, AuthConfig};
use oozer_core::events::EventBus;
use oozer_core::oozie::{self, OozieClient};
use oozer_core::plan::{self, PlanSpec};
use oozer_core::settings::Settings;
use oozer_core::state::{self, TransitionError, dispatch};

use crate::observer::{ObserverHub, forward_bus_events};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub bus: Arc<dyn EventBus>,
    pub hub: Arc<ObserverHub>,
    pub auth: AuthConfig,
    pub settings: Arc<Settings>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NotFound(_) => Self::not_found(err.to_string()),
            TransitionError::Illegal { .. } => Self::conflict(err.to_string()),
            TransitionError::Db(e) => Self::internal(e.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub canceled: i64,
    pub skipped: i64,
    pub total: i64,
}

impl From<PlanProgress> for ProgressResponse {
    fn from(p: PlanProgress) -> Self {
        Self {
            pending: p.pending,
            running: p.running,
            success: p.success,
            failed: p.failed,
            canceled: p.canceled,
            skipped: p.skipped,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlanSummaryResponse {
    #[serde(flatten)]
    pub plan: Plan,
    pub progress: ProgressResponse,
}

#[derive(Debug, Serialize)]
pub struct PlanDetailResponse {
    #[serde(flatten)]
    pub plan: Plan,
    pub progress: ProgressResponse,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct PlanActionResponse {
    pub plan_id: i64,
    pub status: PlanStatus,
}

#[derive(Debug, Serialize)]
pub struct TaskActionResponse {
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Resolve the bearer token from the request into an active user.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

    let claims = auth::verify_token(&state.auth, token)
        .map_err(|e| AppError::unauthorized(e.to_string()))?;

    let user = user_db::get_user_by_username(&state.pool, &claims.sub)
        .await
        .map_err(AppError::internal)?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::unauthorized("inactive user"))?;

    Ok(user)
}

/// Authenticate and require the admin role.
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let user = authenticate(state, headers).await?;
    if user.role != Role::Admin {
        return Err(AppError::forbidden("insufficient permissions"));
    }
    Ok(user)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/auth/login", post(login))
        .route("/api/plans", get(list_plans).post(create_plan))
        .route("/api/plans/{id}", get(get_plan_detail))
        .route("/api/plans/{id}/start", post(start_plan))
        .route("/api/plans/{id}/pause", post(pause_plan))
        .route("/api/plans/{id}/resume", post(resume_plan))
        .route("/api/plans/{id}/stop", post(stop_plan))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/oozie/job/{job_id}", get(oozie_job_info))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    pool: SqlitePool,
    bus: Arc<dyn EventBus>,
    settings: &Settings,
    bind: &str,
    port: u16,
) -> Result<()> {
    let hub = Arc::new(ObserverHub::new());
    let state = AppState {
        pool,
        bus: Arc::clone(&bus),
        hub: Arc::clone(&hub),
        auth: AuthConfig::new(settings.jwt_secret.as_bytes(), settings.jwt_expire_minutes),
        settings: Arc::new(settings.clone()),
    };

    let cancel = CancellationToken::new();
    let forwarder = tokio::spawn(forward_bus_events(bus, hub, cancel.clone()));

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("oozer serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = forwarder.await;
    info!("oozer serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let plans = plan_db::list_plans(&state.pool)
        .await
        .map_err(AppError::internal)?;

    let rows = if plans.is_empty() {
        "<tr><td colspan=\"3\">No plans found.</td></tr>".to_string()
    } else {
        plans
            .iter()
            .map(|p| {
                format!(
                    "<tr><td><a href=\"/api/plans/{id}\">{name}</a></td><td>{status}</td><td>{id}</td></tr>",
                    id = p.id,
                    name = p.name,
                    status = p.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>oozer</title></head><body>\
<h1>oozer</h1>\
<p><a href=\"/api/plans\">/api/plans</a> | <a href=\"/ready\">/ready</a></p>\
<table><tr><th>Plan</th><th>Status</th><th>ID</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn health() -> axum::response::Response {
    Json(serde_json::json!({"ok": true})).into_response()
}

async fn ready(State(state): State<AppState>) -> axum::response::Response {
    let mut checks = serde_json::Map::new();

    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    checks.insert(
        "database".to_owned(),
        if db_ok { "ok" } else { "error" }.into(),
    );

    let bus_ok = state.bus.ping().await;
    checks.insert(
        "event_bus".to_owned(),
        if bus_ok { "ok" } else { "error" }.into(),
    );

    if db_ok && bus_ok {
        Json(serde_json::json!({"status": "ready", "checks": checks})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded", "checks": checks})),
        )
            .into_response()
    }
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<axum::response::Response, AppError> {
    let user = user_db::get_user_by_username(&state.pool, &body.username)
        .await
        .map_err(AppError::internal)?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::unauthorized("invalid credentials"))?;

    if !auth::verify_password(&body.password, &user.password_hash) {
        return Err(AppError::unauthorized("invalid credentials"));
    }

    let access_token = auth::issue_token(&state.auth, &user.username, user.role);
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_owned(),
        role: user.role,
    })
    .into_response())
}

async fn list_plans(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    authenticate(&state, &headers).await?;

    let plans = plan_db::list_plans(&state.pool)
        .await
        .map_err(AppError::internal)?;

    let mut results = Vec::with_capacity(plans.len());
    for plan in plans {
        let progress = task_db::get_plan_progress(&state.pool, plan.id)
            .await
            .map_err(AppError::internal)?;
        results.push(PlanSummaryResponse {
            plan,
            progress: progress.into(),
        });
    }

    Ok(Json(results).into_response())
}

async fn create_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<PlanSpec>,
) -> Result<axum::response::Response, AppError> {
    let user = require_admin(&state, &headers).await?;

    spec.validate().map_err(|e| AppError::bad_request(e.to_string()))?;

    let plan = plan::create_plan(&state.pool, state.bus.as_ref(), &spec, &user.username)
        .await
        .map_err(AppError::internal)?;

    Ok((StatusCode::CREATED, Json(plan)).into_response())
}

async fn get_plan_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    authenticate(&state, &headers).await?;

    let plan = plan_db::get_plan(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("plan {id} not found")))?;

    let progress = task_db::get_plan_progress(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    let tasks = task_db::list_tasks_for_plan(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(PlanDetailResponse {
        plan,
        progress: progress.into(),
        tasks,
    })
    .into_response())
}

async fn transition(
    state: &AppState,
    headers: &HeaderMap,
    plan_id: i64,
    target: PlanStatus,
) -> Result<axum::response::Response, AppError> {
    require_admin(state, headers).await?;

    let plan = state::transition_plan(&state.pool, state.bus.as_ref(), plan_id, target).await?;

    Ok(Json(PlanActionResponse {
        plan_id: plan.id,
        status: plan.status,
    })
    .into_response())
}

async fn start_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    transition(&state, &headers, id, PlanStatus::Running).await
}

async fn pause_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    transition(&state, &headers, id, PlanStatus::Paused).await
}

async fn resume_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    transition(&state, &headers, id, PlanStatus::Running).await
}

async fn stop_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    transition(&state, &headers, id, PlanStatus::Stopped).await
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    require_admin(&state, &headers).await?;

    task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let status = dispatch::cancel_task(&state.pool, state.bus.as_ref(), id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskActionResponse { status }).into_response())
}

async fn retry_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    require_admin(&state, &headers).await?;

    task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let status = dispatch::retry_task(&state.pool, state.bus.as_ref(), id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskActionResponse { status }).into_response())
}

#[derive(Debug, Deserialize)]
struct JobInfoParams {
    plan_id: i64,
}

/// Proxy a job-info lookup to the Oozie server the plan targets.
async fn oozie_job_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Query(params): Query<JobInfoParams>,
) -> Result<axum::response::Response, AppError> {
    authenticate(&state, &headers).await?;

    let plan = plan_db::get_plan(&state.pool, params.plan_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("plan {} not found", params.plan_id)))?;

    let base_url = oozie::command::effective_oozie_url(&plan, &state.settings.oozie_default_url)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let client = OozieClient::new(&base_url, state.settings.oozie_http_timeout())
        .map_err(|e| AppError::bad_gateway(e.to_string()))?;
    let info = client
        .job_info(&job_id)
        .await
        .map_err(|e| AppError::bad_gateway(e.to_string()))?;

    Ok(Json(info).into_response())
}

// ---------------------------------------------------------------------------
// WebSocket observers
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<axum::response::Response, AppError> {
    // Sessions are accepted only when the token verifies and the
    // principal is still active. The check runs before the upgrade so
    // rejected clients get a real HTTP status instead of a dead socket.
    let token = params
        .get("token")
        .ok_or_else(|| AppError::unauthorized("missing token"))?;
    let claims = auth::verify_token(&state.auth, token)
        .map_err(|e| AppError::unauthorized(e.to_string()))?;
    user_db::get_user_by_username(&state.pool, &claims.sub)
        .await
        .map_err(AppError::internal)?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::unauthorized("inactive user"))?;

    let ws = ws.map_err(|_| AppError::bad_request("websocket upgrade required"))?;
    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ObserverHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = hub.register(tx.clone());

    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if text.trim().eq_ignore_ascii_case("ping")
                        && tx.send("{\"event\":\"pong\"}".to_owned()).is_err()
                    {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(session);
    warn!(session, "observer session closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
