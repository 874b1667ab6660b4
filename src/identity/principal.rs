use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Instructor => "instructor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeLevel {
    Admin,
    SuperAdmin,
}

/// Identity asserted by a verified token. Never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege_level: Option<PrivilegeLevel>,
}

impl Principal {
    pub fn new(principal_id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self { principal_id: principal_id.into(), email: email.into(), role, session_id: None, privilege_level: None }
    }

    /// Same identity bound to a privileged session.
    pub fn with_session(mut self, session_id: impl Into<String>, level: PrivilegeLevel) -> Self {
        self.session_id = Some(session_id.into());
        self.privilege_level = Some(level);
        self
    }

    pub fn is_admin(&self) -> bool { self.role == Role::Admin }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_text() {
        for r in [Role::Student, Role::Instructor, Role::Admin] {
            assert_eq!(r.as_str().parse::<Role>().unwrap(), r);
        }
        assert!("teacher".parse::<Role>().is_err());
    }

    #[test]
    fn with_session_binds_session_and_level() {
        let p = Principal::new("u1", "a@example.com", Role::Admin);
        assert!(p.is_admin());
        assert!(p.session_id.is_none());
        let p = p.with_session("s1", PrivilegeLevel::Admin);
        assert_eq!(p.session_id.as_deref(), Some("s1"));
        assert_eq!(p.privilege_level, Some(PrivilegeLevel::Admin));
        assert!(!Principal::new("u2", "b@example.com", Role::Instructor).is_admin());
    }
}
