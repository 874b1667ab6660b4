use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action names written by this crate. Callers may log their own actions too.
pub mod actions {
    pub const LOGIN: &str = "login";
    pub const ADMIN_LOGIN: &str = "admin_login";
    pub const FAILED_LOGIN: &str = "failed_login";
    pub const LOGOUT: &str = "logout";
    pub const FORCE_LOGOUT: &str = "force_logout";
    pub const SESSION_TIMEOUT: &str = "session_timeout";
    pub const EXPORT_AUDIT_LOG: &str = "export_audit_log";
}

/// One immutable row of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: Uuid,
    /// Insertion order; breaks timestamp ties.
    pub seq: u64,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub change_description: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied part of an entry; id, seq and timestamp are assigned on append.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub change_description: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditRecord {
    pub fn new(actor_id: impl Into<String>, action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self { actor_id: actor_id.into(), action: action.into(), resource_type: resource_type.into(), ..Default::default() }
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.change_description = text.into();
        self
    }

    pub fn origin(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip;
        self.user_agent = user_agent;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    Login,
    AdminLogin,
    FailedLogin,
    Logout,
    SessionTerminated,
    SessionTimeout,
    SessionExpired,
    BreakGlassLogin,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::Login => actions::LOGIN,
            SecurityEventType::AdminLogin => actions::ADMIN_LOGIN,
            SecurityEventType::FailedLogin => actions::FAILED_LOGIN,
            SecurityEventType::Logout => actions::LOGOUT,
            SecurityEventType::SessionTerminated => "session_terminated",
            SecurityEventType::SessionTimeout => actions::SESSION_TIMEOUT,
            SecurityEventType::SessionExpired => "session_expired",
            SecurityEventType::BreakGlassLogin => "break_glass_login",
        }
    }

    pub fn is_login_attempt(&self) -> bool {
        matches!(self, SecurityEventType::Login | SecurityEventType::AdminLogin | SecurityEventType::FailedLogin | SecurityEventType::BreakGlassLogin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub principal_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            principal_id: None,
            ip_address: None,
            user_agent: None,
            severity,
            details: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn principal(mut self, id: impl Into<String>) -> Self {
        self.principal_id = Some(id.into());
        self
    }

    pub fn origin(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
