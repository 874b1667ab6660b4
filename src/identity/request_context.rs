use chrono::{DateTime, Utc};

use super::Principal;

/// Per-request state the guards read from and write to.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Raw bearer credential, without the scheme.
    pub bearer: Option<String>,
    /// Set by a successful authenticate stage.
    pub principal: Option<Principal>,
    /// Hard expiry of the privileged token, set by `AuthenticatePrivileged`.
    pub token_expires_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn with_bearer(token: impl Into<String>) -> Self {
        Self { bearer: Some(token.into()), ..Default::default() }
    }

    pub fn from_authorization(header: Option<&str>) -> Self {
        Self { bearer: header.and_then(bearer_token).map(str::to_string), ..Default::default() }
    }

    pub fn actor_id(&self) -> &str {
        self.principal.as_ref().map(|p| p.principal_id.as_str()).unwrap_or("anonymous")
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer   tok "), Some("tok"));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("token-only"), None);
    }
}
