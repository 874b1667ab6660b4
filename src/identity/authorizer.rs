//! The authorization gate: an ordered pipeline of guards.
//!
//! Each guard either hands the request on or stops it with one `GateError`.
//! Nothing after a failing guard runs, so a bad token never reaches the
//! resource-fact collaborator.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::audit::{SecurityEvent, SecurityEventMonitor, SecurityEventType, Severity};
use crate::error::{ForbiddenReason, GateError, GateResult};

use super::policy::{ResourcePolicy, ResourceRef};
use super::principal::{Principal, Role};
use super::request_context::RequestContext;
use super::session::SessionRegistry;
use super::token::{decode_untrusted, TokenCodec, TokenError, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    Authenticate,
    AuthenticatePrivileged,
    RequireRole(Vec<Role>),
    RequireResourceAccess(ResourceRef),
}

pub struct AuthorizationGate {
    codec: Arc<TokenCodec>,
    sessions: Arc<SessionRegistry>,
    policy: ResourcePolicy,
    monitor: Arc<SecurityEventMonitor>,
}

impl AuthorizationGate {
    pub fn new(
        codec: Arc<TokenCodec>,
        sessions: Arc<SessionRegistry>,
        policy: ResourcePolicy,
        monitor: Arc<SecurityEventMonitor>,
    ) -> Self {
        Self { codec, sessions, policy, monitor }
    }

    pub fn codec(&self) -> &Arc<TokenCodec> { &self.codec }

    pub fn sessions(&self) -> &Arc<SessionRegistry> { &self.sessions }

    /// Run `guards` in order; returns the principal attached by the pipeline.
    pub async fn run(&self, guards: &[Guard], ctx: &mut RequestContext) -> GateResult<Principal> {
        for guard in guards {
            match guard {
                Guard::Authenticate => { self.authenticate(ctx)?; }
                Guard::AuthenticatePrivileged => { self.authenticate_privileged(ctx)?; }
                Guard::RequireRole(allowed) => require_role(ctx, allowed)?,
                Guard::RequireResourceAccess(resource) => self.require_resource_access(ctx, resource).await?,
            }
        }
        ctx.principal.clone().ok_or(GateError::Unauthenticated)
    }

    pub fn authenticate(&self, ctx: &mut RequestContext) -> GateResult<Principal> {
        let token = ctx.bearer.as_deref().ok_or(GateError::Unauthenticated)?;
        let principal = self.codec.verify(token, TokenKind::Standard).map_err(|e| {
            debug!(target: "coursegate::gate", error = %e, request_id = ?ctx.request_id, "standard token rejected");
            map_token_error(&e)
        })?;
        ctx.principal = Some(principal.clone());
        Ok(principal)
    }

    pub fn authenticate_privileged(&self, ctx: &mut RequestContext) -> GateResult<Principal> {
        let token = ctx.bearer.as_deref().ok_or(GateError::Unauthenticated)?;
        let verified = match self.codec.verify_token(token, TokenKind::Privileged) {
            Ok(v) => v,
            Err(TokenError::Expired) => {
                self.record_timeout(token, ctx);
                return Err(GateError::TokenExpired);
            }
            Err(e) => {
                warn!(target: "coursegate::gate", error = %e, ip = ?ctx.ip_address, request_id = ?ctx.request_id, "privileged token rejected");
                return Err(map_token_error(&e));
            }
        };
        let principal = verified.principal;
        let sid = principal.session_id.as_deref().ok_or(GateError::SessionInvalid)?;
        if self.sessions.activate(sid, &principal.principal_id).is_none() {
            warn!(target: "coursegate::gate", principal = %principal.principal_id, sid, request_id = ?ctx.request_id, "no live session for privileged token");
            return Err(GateError::SessionInvalid);
        }
        ctx.token_expires_at = Some(verified.expires_at);
        ctx.principal = Some(principal.clone());
        Ok(principal)
    }

    pub async fn require_resource_access(&self, ctx: &RequestContext, resource: &ResourceRef) -> GateResult<()> {
        let principal = ctx.principal.as_ref().ok_or(GateError::Unauthenticated)?;
        self.policy.check(principal, resource).await
    }

    // Expired privileged token: log whoever it claims to be. The claims are
    // unverified and only ever reach the audit trail.
    fn record_timeout(&self, token: &str, ctx: &RequestContext) {
        let claimed = decode_untrusted(token);
        let mut ev = SecurityEvent::new(SecurityEventType::SessionTimeout, Severity::Low, self.monitor.now())
            .origin(ctx.ip_address.clone(), ctx.user_agent.clone())
            .details(serde_json::json!({
                "untrusted_session_id": claimed.as_ref().and_then(|c| c.claimed_session_id.clone()),
            }));
        if let Some(pid) = claimed.and_then(|c| c.claimed_principal_id) {
            ev = ev.principal(pid);
        }
        self.monitor.record_best_effort(ev);
    }
}

pub fn require_role(ctx: &RequestContext, allowed: &[Role]) -> GateResult<()> {
    let principal = ctx.principal.as_ref().ok_or(GateError::Unauthenticated)?;
    if allowed.contains(&principal.role) {
        Ok(())
    } else {
        debug!(target: "coursegate::gate", principal = %principal.principal_id, role = %principal.role, request_id = ?ctx.request_id, "role not allowed");
        Err(GateError::Forbidden(ForbiddenReason::Role))
    }
}

fn map_token_error(e: &TokenError) -> GateError {
    match e {
        TokenError::Expired => GateError::TokenExpired,
        TokenError::Malformed(_) | TokenError::SignatureMismatch | TokenError::Unissuable(_) => GateError::TokenInvalid,
    }
}
