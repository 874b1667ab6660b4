//!
//! coursegate HTTP server
//! ----------------------
//! Axum front for the authorization gate. Every protected route goes through
//! a guard middleware that builds a `RequestContext` from the request headers
//! and runs the gate pipeline before the handler sees the request.
//!
//! Route groups:
//! - `/auth/*`: standard and privileged login, privileged logout and status.
//! - `/admin/*`: session oversight, audit query and export, login-attempt
//!   summary. Requires a live privileged session and the admin role.
//! - `/courses/*`, `/lessons/*`: resource access checks for any principal.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{
    actions, AuditFilter, AuditLog, AuditPage, AuditQuery, AuditRecord, AuditStore, ExportFormat, ExportRequester,
    LoginAttemptSummary, MemoryAuditStore, MonitorThresholds, SecurityEvent, SecurityEventMonitor, SecurityEventType,
    Severity, SortField, SortOrder, DEFAULT_PAGE_SIZE,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::identity::{
    spawn_sweeper, AuthorizationGate, DirectoryUser, DisplayProfile, Guard, LoginRequest, LoginResponse, LoginService,
    MemoryCourseCatalog, MemoryUserDirectory, PrivilegeLevel, RequestContext, ResourceFactSource, ResourcePolicy,
    ResourceRef, Role, SessionRecord, SessionRegistry, SessionStatus, TokenCodec, UserDirectory,
};

pub const INTEGRITY_HEADER: &str = "x-audit-integrity-hash";
pub const ENTRY_COUNT_HEADER: &str = "x-audit-entry-count";
const DEFAULT_ATTEMPT_WINDOW_DAYS: u32 = 7;
const MAX_ATTEMPT_WINDOW_DAYS: u32 = 365;
const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1_000;

/// Shared server state injected into all handlers. Every collaborator is
/// shared, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AuthorizationGate>,
    pub sessions: Arc<SessionRegistry>,
    pub audit: Arc<AuditLog>,
    pub monitor: Arc<SecurityEventMonitor>,
    pub login: Arc<LoginService>,
    pub directory: Arc<dyn UserDirectory>,
}

impl AppState {
    /// Wire the gate from its collaborators. The platform supplies the user
    /// directory, resource facts and audit store; everything else is built here.
    pub fn build(
        config: &GateConfig,
        clock: SharedClock,
        directory: Arc<dyn UserDirectory>,
        facts: Arc<dyn ResourceFactSource>,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        let codec = Arc::new(TokenCodec::new(
            config.signing_secret.as_bytes().to_vec(),
            config.standard_token_ttl,
            config.privileged_token_ttl,
            clock.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            clock.clone(),
            config.privileged_token_ttl,
            config.session_warning_threshold,
        ));
        let audit = Arc::new(AuditLog::new(store, clock));
        let thresholds = MonitorThresholds { failure_threshold: config.failed_login_threshold, ..Default::default() };
        let monitor = Arc::new(SecurityEventMonitor::new(audit.clone(), thresholds));
        let policy = ResourcePolicy::new(facts, config.lookup_timeout);
        let gate = Arc::new(AuthorizationGate::new(codec.clone(), sessions.clone(), policy, monitor.clone()));
        let login = Arc::new(LoginService::new(
            directory.clone(),
            codec,
            sessions.clone(),
            monitor.clone(),
            config.break_glass.clone(),
        ));
        Self { gate, sessions, audit, monitor, login, directory }
    }
}

/// Build the full route table over `state`.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{session_id}", delete(force_logout))
        .route("/admin/audit", get(query_audit))
        .route("/admin/audit/export", get(export_audit))
        .route("/admin/security/login-attempts", get(login_attempts))
        .route("/admin/security/events", get(security_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let privileged = Router::new()
        .route("/auth/admin/logout", post(admin_logout))
        .route("/auth/admin/session", get(session_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_privileged));

    let user = Router::new()
        .route("/courses/{course_id}/access", get(course_access))
        .route("/lessons/{lesson_id}/access", get(lesson_access))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    Router::new()
        .route("/", get(|| async { "coursegate ok" }))
        .route("/auth/login", post(login))
        .route("/auth/admin/login", post(admin_login))
        .merge(admin)
        .merge(privileged)
        .merge(user)
        .with_state(state)
}

/// Start the standalone server: in-memory collaborators, background sweeper,
/// graceful shutdown on ctrl-c.
pub async fn run(config: GateConfig) -> anyhow::Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let directory = Arc::new(MemoryUserDirectory::new());
    if let Some(seed) = &config.seed_admin {
        directory.insert(DirectoryUser {
            principal_id: format!("admin:{}", seed.email.to_lowercase()),
            email: seed.email.clone(),
            role: Role::Admin,
            password_hash: seed.password_hash.clone(),
            display_name: "Administrator".to_string(),
            privilege_level: Some(PrivilegeLevel::Admin),
        });
        info!("Seeded admin account {}", seed.email);
    } else if config.break_glass.is_none() {
        warn!("No admin account or break-glass credential configured; privileged routes are unreachable");
    }
    let catalog = Arc::new(MemoryCourseCatalog::new());
    let store = Arc::new(MemoryAuditStore::new());
    let state = AppState::build(&config, clock, directory, catalog, store);

    let sweeper = spawn_sweeper(state.sessions.clone(), config.sweep_interval, Some(state.monitor.clone()));
    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    sweeper.stop().await;
    info!("Server stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {}", e);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

/// Client address and user agent. Takes the first hop of `x-forwarded-for`,
/// then `x-real-ip`.
fn client_origin(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string);
    let ua = header_str(headers, header::USER_AGENT.as_str()).map(str::to_string);
    (ip, ua)
}

fn context_from_headers(headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::from_authorization(header_str(headers, header::AUTHORIZATION.as_str()));
    let (ip, ua) = client_origin(headers);
    ctx.ip_address = ip;
    ctx.user_agent = ua;
    ctx.request_id = header_str(headers, "x-request-id").map(str::to_string);
    ctx
}

async fn guarded(state: &AppState, guards: &[Guard], mut req: Request, next: Next) -> Response {
    let mut ctx = context_from_headers(req.headers());
    match state.gate.run(guards, &mut ctx).await {
        Ok(_) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => {
            debug!(target: "coursegate::gate", code = e.code(), request_id = ?ctx.request_id, ip = ?ctx.ip_address, "request denied");
            e.into_response()
        }
    }
}

/// Query-string parse failures answer in the same error shape as the gate.
fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> GateResult<T> {
    query.map(|Query(params)| params).map_err(|rejection| GateError::BadRequest(rejection.body_text()))
}

async fn require_user(State(state): State<AppState>, req: Request, next: Next) -> Response {
    guarded(&state, &[Guard::Authenticate], req, next).await
}

async fn require_privileged(State(state): State<AppState>, req: Request, next: Next) -> Response {
    guarded(&state, &[Guard::AuthenticatePrivileged], req, next).await
}

async fn require_admin(State(state): State<AppState>, req: Request, next: Next) -> Response {
    guarded(&state, &[Guard::AuthenticatePrivileged, Guard::RequireRole(vec![Role::Admin])], req, next).await
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<LoginRequest>,
) -> GateResult<Json<LoginResponse>> {
    (payload.ip, payload.user_agent) = client_origin(&headers);
    state.login.login(&payload).await.map(Json)
}

async fn admin_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<LoginRequest>,
) -> GateResult<Json<LoginResponse>> {
    (payload.ip, payload.user_agent) = client_origin(&headers);
    state.login.admin_login(&payload).await.map(Json)
}

async fn admin_logout(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> GateResult<impl IntoResponse> {
    let principal = ctx.principal.as_ref().ok_or(GateError::Unauthenticated)?;
    let ended = state.login.logout(principal, ctx.ip_address.clone(), ctx.user_agent.clone());
    Ok(Json(json!({"status": "ok", "session_ended": ended})))
}

async fn session_status(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> GateResult<Json<SessionStatus>> {
    let sid = ctx.principal.as_ref().and_then(|p| p.session_id.as_deref()).ok_or(GateError::SessionInvalid)?;
    state.sessions.status(sid, ctx.token_expires_at).map(Json).ok_or(GateError::SessionInvalid)
}

/// Live session joined with the owner's display profile, when available.
#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    session: SessionRecord,
    profile: Option<DisplayProfile>,
}

async fn list_sessions(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> Json<Vec<SessionView>> {
    let mut views = Vec::new();
    for session in state.sessions.list() {
        // Enrichment is cosmetic; a directory failure still lists the session.
        let profile = match state.directory.display_profile(&session.principal_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "coursegate::auth", principal = %session.principal_id, error = %e, "display profile lookup failed");
                None
            }
        };
        views.push(SessionView { session, profile });
    }
    state.audit.append_best_effort(
        AuditRecord::new(ctx.actor_id(), "view_sessions", "session")
            .describe(format!("listed {} active sessions", views.len()))
            .origin(ctx.ip_address.clone(), ctx.user_agent.clone()),
    );
    Json(views)
}

#[derive(Debug, Default, Deserialize)]
struct ForceLogoutBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn force_logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(session_id): Path<String>,
    body: Option<Json<ForceLogoutBody>>,
) -> GateResult<impl IntoResponse> {
    let actor = ctx.actor_id().to_string();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reason = body.reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).unwrap_or_else(|| "unspecified".into());
    let origin = (ctx.ip_address.clone(), ctx.user_agent.clone());

    let Some(target) = state.sessions.get(&session_id) else {
        state.audit.append_best_effort(
            AuditRecord::new(&actor, actions::FORCE_LOGOUT, "session")
                .resource(&session_id)
                .describe(format!("no such session; reason: {}", reason))
                .origin(origin.0, origin.1),
        );
        return Err(GateError::NotFound);
    };

    // The trail entry is written before the session goes away.
    let terminated_at = state.audit.clock().now();
    state.audit.append(
        AuditRecord::new(&actor, actions::FORCE_LOGOUT, "session")
            .resource(&session_id)
            .describe(
                json!({
                    "terminated_principal": target.principal_id,
                    "reason": reason,
                    "terminated_at": terminated_at,
                })
                .to_string(),
            )
            .origin(origin.0.clone(), origin.1.clone()),
    )?;
    let existed = state.sessions.force_logout(&session_id, &actor);
    state.monitor.record_best_effort(
        SecurityEvent::new(SecurityEventType::SessionTerminated, Severity::Medium, terminated_at)
            .principal(target.principal_id.clone())
            .origin(origin.0, origin.1)
            .details(json!({"session_id": session_id, "terminated_by": actor, "reason": reason})),
    );
    if !existed {
        return Err(GateError::NotFound);
    }
    Ok(Json(json!({
        "status": "ok",
        "session_id": session_id,
        "terminated_by": actor,
        "reason": reason,
        "terminated_at": terminated_at,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct AuditParams {
    actor_id: Option<String>,
    action: Option<String>,
    resource_type: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    search: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
    sort_by: Option<SortField>,
    order: Option<SortOrder>,
    /// Export only; `json` unless given.
    format: Option<String>,
}

impl AuditParams {
    fn filter(&self) -> AuditFilter {
        AuditFilter {
            actor_id: self.actor_id.clone(),
            action: self.action.clone(),
            resource_type: self.resource_type.clone(),
            from: self.from,
            to: self.to,
            search: self.search.clone(),
        }
    }
}

async fn query_audit(
    State(state): State<AppState>,
    params: Result<Query<AuditParams>, QueryRejection>,
) -> GateResult<Json<AuditPage>> {
    let params = query_params(params)?;
    let q = AuditQuery {
        filter: params.filter(),
        page: params.page.unwrap_or(1),
        per_page: params.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
        sort_by: params.sort_by.unwrap_or_default(),
        order: params.order.unwrap_or_default(),
    };
    state.audit.query(&q).map(Json)
}

async fn export_audit(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    params: Result<Query<AuditParams>, QueryRejection>,
) -> GateResult<Response> {
    let params = query_params(params)?;
    let format: ExportFormat = params.format.as_deref().unwrap_or("json").parse()?;
    let requester = ExportRequester {
        actor_id: ctx.actor_id().to_string(),
        ip_address: ctx.ip_address.clone(),
        user_agent: ctx.user_agent.clone(),
    };
    let export = state.audit.export(&params.filter(), format, &requester)?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    let disposition = format!(
        "attachment; filename=\"audit-{}.{}\"",
        export.generated_at.format("%Y%m%dT%H%M%SZ"),
        format.as_str()
    );
    headers.insert(header::CONTENT_DISPOSITION, header_value(&disposition)?);
    headers.insert(INTEGRITY_HEADER, header_value(&export.integrity_hash)?);
    headers.insert(ENTRY_COUNT_HEADER, header_value(&export.entry_count.to_string())?);
    Ok((headers, export.payload).into_response())
}

fn header_value(s: &str) -> GateResult<HeaderValue> {
    HeaderValue::from_str(s).map_err(|e| GateError::Internal(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct WindowParams {
    days: Option<u32>,
}

async fn login_attempts(
    State(state): State<AppState>,
    params: Result<Query<WindowParams>, QueryRejection>,
) -> GateResult<Json<LoginAttemptSummary>> {
    let params = query_params(params)?;
    let days = params.days.unwrap_or(DEFAULT_ATTEMPT_WINDOW_DAYS);
    if days == 0 || days > MAX_ATTEMPT_WINDOW_DAYS {
        return Err(GateError::BadRequest(format!("days must be between 1 and {}", MAX_ATTEMPT_WINDOW_DAYS)));
    }
    state.monitor.aggregate_login_attempts(days).map(Json)
}

#[derive(Debug, Default, Deserialize)]
struct EventParams {
    limit: Option<usize>,
    min_severity: Option<Severity>,
}

async fn security_events(
    State(state): State<AppState>,
    params: Result<Query<EventParams>, QueryRejection>,
) -> GateResult<Json<Vec<SecurityEvent>>> {
    let params = query_params(params)?;
    let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    let min = params.min_severity.unwrap_or(Severity::Low);
    state.monitor.recent_events(limit, min).map(Json)
}

async fn course_access(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(course_id): Path<String>,
) -> GateResult<impl IntoResponse> {
    resource_access(&state, &ctx, ResourceRef::Course(course_id)).await
}

async fn lesson_access(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(lesson_id): Path<String>,
) -> GateResult<impl IntoResponse> {
    resource_access(&state, &ctx, ResourceRef::Lesson(lesson_id)).await
}

async fn resource_access(state: &AppState, ctx: &RequestContext, resource: ResourceRef) -> GateResult<Json<serde_json::Value>> {
    state.gate.require_resource_access(ctx, &resource).await?;
    Ok(Json(json!({
        "status": "ok",
        "access": "granted",
        "resource_type": resource.kind(),
        "resource_id": resource.id(),
    })))
}
