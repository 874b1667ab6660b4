//! Compact signed tokens: HS256 JWTs minted and checked with `jsonwebtoken`.
//!
//! Two shapes share the format. Standard tokens carry identity claims only;
//! privileged tokens also carry the session id and privilege level. The MAC
//! covers header and claims using the process-wide secret, so rotating the
//! secret invalidates every outstanding token.
//!
//! Verification reports malformed structure, signature mismatch and expiry
//! as distinct errors. The library checks the signature with zero leeway and
//! its own expiry check switched off; expiry is compared against the
//! injected clock, read once.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

use super::principal::{PrivilegeLevel, Principal, Role};

const ALG: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Standard,
    Privileged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("token signature mismatch")]
    SignatureMismatch,
    #[error("token expired")]
    Expired,
    #[error("cannot issue token: {0}")]
    Unissuable(&'static str),
}

impl From<JwtError> for TokenError {
    fn from(e: JwtError) -> Self {
        match e.kind() {
            ErrorKind::InvalidSignature => TokenError::SignatureMismatch,
            ErrorKind::InvalidToken => TokenError::Malformed("expected three segments"),
            ErrorKind::Base64(_) => TokenError::Malformed("segment is not base64url"),
            ErrorKind::Json(_) | ErrorKind::Utf8(_) => TokenError::Malformed("segment is not valid json"),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => TokenError::Malformed("unsupported algorithm"),
            ErrorKind::MissingRequiredClaim(_) => TokenError::Malformed("required claim missing"),
            ErrorKind::InvalidKeyFormat => TokenError::Unissuable("invalid signing key"),
            _ => TokenError::Malformed("token rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    role: Role,
    kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plv: Option<PrivilegeLevel>,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A token that passed signature, kind and expiry checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub principal: Principal,
    pub expires_at: DateTime<Utc>,
}

/// Claims read from a token WITHOUT checking its signature.
///
/// Only for forensic logging of failed authentication. Nothing in here may
/// feed an authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrustedClaims {
    pub claimed_principal_id: Option<String>,
    pub claimed_session_id: Option<String>,
}

pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    standard_ttl: Duration,
    privileged_ttl: Duration,
    clock: SharedClock,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("standard_ttl", &self.standard_ttl)
            .field("privileged_ttl", &self.privileged_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>, standard_ttl: Duration, privileged_ttl: Duration, clock: SharedClock) -> Self {
        let secret = secret.into();
        let mut validation = Validation::new(ALG);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;
        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
            validation,
            standard_ttl,
            privileged_ttl,
            clock,
        }
    }

    pub fn ttl_for(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Standard => self.standard_ttl,
            TokenKind::Privileged => self.privileged_ttl,
        }
    }

    pub fn issue(&self, principal: &Principal, kind: TokenKind) -> Result<IssuedToken, TokenError> {
        self.issue_with_ttl(principal, kind, self.ttl_for(kind))
    }

    pub fn issue_with_ttl(&self, principal: &Principal, kind: TokenKind, ttl: Duration) -> Result<IssuedToken, TokenError> {
        let (sid, plv) = match kind {
            TokenKind::Standard => (None, None),
            TokenKind::Privileged => match (&principal.session_id, principal.privilege_level) {
                (Some(sid), Some(plv)) => (Some(sid.clone()), Some(plv)),
                _ => return Err(TokenError::Unissuable("privileged token requires session id and privilege level")),
            },
        };
        let now = self.clock.now();
        let iat = now.timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::Unissuable("ttl out of range"))?;
        let exp = iat.checked_add(ttl_secs).ok_or(TokenError::Unissuable("ttl out of range"))?;
        let claims = Claims {
            sub: principal.principal_id.clone(),
            email: principal.email.clone(),
            role: principal.role,
            kind,
            sid,
            plv,
            iat,
            exp,
        };
        let token = jsonwebtoken::encode(&Header::new(ALG), &claims, &self.encoding)
            .map_err(|_| TokenError::Unissuable("claims not encodable"))?;
        Ok(IssuedToken {
            token,
            kind,
            issued_at: from_unix(iat),
            expires_at: from_unix(exp),
        })
    }

    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Principal, TokenError> {
        self.verify_token(token, kind).map(|v| v.principal)
    }

    /// `verify`, keeping the token's own hard expiry.
    pub fn verify_token(&self, token: &str, kind: TokenKind) -> Result<VerifiedToken, TokenError> {
        let claims = jsonwebtoken::decode::<Claims>(token.trim(), &self.decoding, &self.validation)?.claims;
        if claims.kind != kind {
            return Err(TokenError::Malformed("token kind mismatch"));
        }
        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }

        let mut principal = Principal::new(claims.sub, claims.email, claims.role);
        if kind == TokenKind::Privileged {
            match (claims.sid, claims.plv) {
                (Some(sid), Some(plv)) => principal = principal.with_session(sid, plv),
                _ => return Err(TokenError::Malformed("privileged claims missing")),
            }
        }
        Ok(VerifiedToken { principal, expires_at: from_unix(claims.exp) })
    }
}

#[derive(Debug, Deserialize)]
struct ClaimedIdentity {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    sid: Option<String>,
}

/// Best-effort read of the claimed identity, ignoring the signature entirely.
pub fn decode_untrusted(token: &str) -> Option<UntrustedClaims> {
    let mut validation = Validation::new(ALG);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let claimed = jsonwebtoken::decode::<ClaimedIdentity>(token.trim(), &DecodingKey::from_secret(&[]), &validation)
        .ok()?
        .claims;
    if claimed.sub.is_none() && claimed.sid.is_none() {
        return None;
    }
    Some(UntrustedClaims { claimed_principal_id: claimed.sub, claimed_session_id: claimed.sid })
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}
