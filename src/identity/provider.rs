use std::sync::Arc;

use anyhow::anyhow;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use password_hash::{PasswordHash, SaltString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{SecurityEvent, SecurityEventMonitor, SecurityEventType, Severity};
use crate::config::Credential;
use crate::error::{ForbiddenReason, GateError, GateResult};

use super::principal::{Principal, PrivilegeLevel, Role};
use super::session::SessionRegistry;
use super::token::{TokenCodec, TokenKind};

pub const BREAK_GLASS_PRINCIPAL: &str = "break-glass";

/// Account as held by the platform's user directory.
#[derive(Debug, Clone)]
pub struct DirectoryUser {
    pub principal_id: String,
    pub email: String,
    pub role: Role,
    /// argon2 PHC string
    pub password_hash: String,
    pub display_name: String,
    /// Level granted on privileged login; admins default to `Admin`.
    pub privilege_level: Option<PrivilegeLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayProfile {
    pub principal_id: String,
    pub email: String,
    pub display_name: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<DirectoryUser>>;
    async fn display_profile(&self, principal_id: &str) -> anyhow::Result<Option<DisplayProfile>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(skip)]
    pub ip: Option<String>,
    #[serde(skip)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_kind: TokenKind,
    pub expires_at: DateTime<Utc>,
    pub principal: Principal,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let phc = Argon2::default().hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

// 256-bit random session id, base64url without padding
fn new_session_id() -> GateResult<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| GateError::Internal(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

pub struct LoginService {
    directory: Arc<dyn UserDirectory>,
    codec: Arc<TokenCodec>,
    sessions: Arc<SessionRegistry>,
    monitor: Arc<SecurityEventMonitor>,
    break_glass: Option<Credential>,
    /// Checked against when the email is unknown, so both paths pay for argon2.
    decoy_hash: Option<String>,
}

impl LoginService {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        codec: Arc<TokenCodec>,
        sessions: Arc<SessionRegistry>,
        monitor: Arc<SecurityEventMonitor>,
        break_glass: Option<Credential>,
    ) -> Self {
        if break_glass.is_some() {
            warn!(target: "coursegate::auth", "break-glass credential is configured; every use is audited at high severity");
        }
        let decoy_hash = match hash_password("coursegate-unknown-account") {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(target: "coursegate::auth", "could not prepare decoy password hash: {:#}", e);
                None
            }
        };
        Self { directory, codec, sessions, monitor, break_glass, decoy_hash }
    }

    /// Standard login for any role.
    pub async fn login(&self, req: &LoginRequest) -> GateResult<LoginResponse> {
        let user = self.check_credentials(req).await?;
        let principal = Principal::new(user.principal_id.clone(), user.email.clone(), user.role);
        let issued = self.codec.issue(&principal, TokenKind::Standard).map_err(|e| GateError::Internal(e.to_string()))?;
        self.monitor.record_best_effort(
            SecurityEvent::new(SecurityEventType::Login, Severity::Low, self.monitor.now())
                .principal(principal.principal_id.clone())
                .origin(req.ip.clone(), req.user_agent.clone()),
        );
        info!(target: "coursegate::auth", principal = %principal.principal_id, role = %principal.role, "auth.login");
        Ok(LoginResponse { token: issued.token, token_kind: TokenKind::Standard, expires_at: issued.expires_at, principal })
    }

    /// Privileged login: admins only. Creates the session the token is bound to.
    pub async fn admin_login(&self, req: &LoginRequest) -> GateResult<LoginResponse> {
        let (principal, event_type, severity) = match self.break_glass_principal(req)? {
            Some(p) => (p, SecurityEventType::BreakGlassLogin, Severity::High),
            None => {
                let user = self.check_credentials(req).await?;
                if user.role != Role::Admin {
                    self.record_failure(req, Some(&user.principal_id), "not_admin");
                    return Err(GateError::Forbidden(ForbiddenReason::Role));
                }
                let level = user.privilege_level.unwrap_or(PrivilegeLevel::Admin);
                let sid = new_session_id()?;
                (
                    Principal::new(user.principal_id, user.email, Role::Admin).with_session(sid, level),
                    SecurityEventType::AdminLogin,
                    Severity::Medium,
                )
            }
        };
        let sid = principal.session_id.clone().ok_or_else(|| GateError::Internal("privileged principal without session".into()))?;

        self.sessions.create(&principal.principal_id, &sid);
        let issued = match self.codec.issue(&principal, TokenKind::Privileged) {
            Ok(t) => t,
            Err(e) => {
                self.sessions.destroy(&sid);
                return Err(GateError::Internal(e.to_string()));
            }
        };
        // No trail, no privileged session.
        let recorded = self.monitor.record_event(
            SecurityEvent::new(event_type, severity, self.monitor.now())
                .principal(principal.principal_id.clone())
                .origin(req.ip.clone(), req.user_agent.clone())
                .details(serde_json::json!({ "session_id": sid, "privilege_level": principal.privilege_level })),
        );
        if let Err(e) = recorded {
            self.sessions.destroy(&sid);
            return Err(e);
        }
        info!(target: "coursegate::auth", principal = %principal.principal_id, sid = %sid, "auth.admin_login");
        Ok(LoginResponse { token: issued.token, token_kind: TokenKind::Privileged, expires_at: issued.expires_at, principal })
    }

    /// End the principal's privileged session. Returns whether one was live.
    pub fn logout(&self, principal: &Principal, ip: Option<String>, user_agent: Option<String>) -> bool {
        let Some(sid) = principal.session_id.as_deref() else { return false };
        let existed = self.sessions.destroy(sid);
        self.monitor.record_best_effort(
            SecurityEvent::new(SecurityEventType::Logout, Severity::Low, self.monitor.now())
                .principal(principal.principal_id.clone())
                .origin(ip, user_agent)
                .details(serde_json::json!({ "session_id": sid, "existed": existed })),
        );
        existed
    }

    async fn check_credentials(&self, req: &LoginRequest) -> GateResult<DirectoryUser> {
        let found = self.directory.find_by_email(&req.email).await.map_err(|e| {
            tracing::error!(target: "coursegate::auth", "user directory lookup failed: {:#}", e);
            GateError::storage(e)
        })?;
        match found {
            Some(user) if verify_password(&user.password_hash, &req.password) => Ok(user),
            Some(user) => {
                self.record_failure(req, Some(&user.principal_id), "invalid_credentials");
                Err(GateError::Unauthenticated)
            }
            None => {
                if let Some(decoy) = &self.decoy_hash {
                    verify_password(decoy, &req.password);
                }
                self.record_failure(req, None, "invalid_credentials");
                Err(GateError::Unauthenticated)
            }
        }
    }

    fn break_glass_principal(&self, req: &LoginRequest) -> GateResult<Option<Principal>> {
        let Some(bg) = &self.break_glass else { return Ok(None) };
        if !bg.email.eq_ignore_ascii_case(req.email.trim()) {
            return Ok(None);
        }
        if !verify_password(&bg.password_hash, &req.password) {
            self.record_failure(req, Some(BREAK_GLASS_PRINCIPAL), "invalid_break_glass_credentials");
            return Err(GateError::Unauthenticated);
        }
        let sid = new_session_id()?;
        Ok(Some(Principal::new(BREAK_GLASS_PRINCIPAL, bg.email.clone(), Role::Admin).with_session(sid, PrivilegeLevel::SuperAdmin)))
    }

    fn record_failure(&self, req: &LoginRequest, principal_id: Option<&str>, reason: &str) {
        let mut ev = SecurityEvent::new(SecurityEventType::FailedLogin, Severity::Medium, self.monitor.now())
            .origin(req.ip.clone(), req.user_agent.clone())
            .details(serde_json::json!({ "email": req.email, "reason": reason }));
        if let Some(id) = principal_id {
            ev = ev.principal(id);
        }
        warn!(target: "coursegate::auth", reason, ip = ?req.ip, "auth.failed_login");
        self.monitor.record_best_effort(ev);
    }
}
