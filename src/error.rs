//! Closed error taxonomy for every decision the gate can make.
//! Control flow matches on variants; `message()` is presentation only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForbiddenReason {
    /// Principal's role is not in the allowed set.
    Role,
    /// Instructor touching a course owned by someone else.
    NotOwner,
    /// Student without an enrollment record.
    NotEnrolled,
}

impl ForbiddenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForbiddenReason::Role => "role",
            ForbiddenReason::NotOwner => "not_owner",
            ForbiddenReason::NotEnrolled => "not_enrolled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("token expired")]
    TokenExpired,
    #[error("token invalid")]
    TokenInvalid,
    #[error("privileged session invalid")]
    SessionInvalid,
    #[error("forbidden ({})", .0.as_str())]
    Forbidden(ForbiddenReason),
    #[error("payment required")]
    PaymentRequired,
    #[error("not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("resource lookup timed out")]
    LookupTimeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::Unauthenticated => "unauthenticated",
            GateError::TokenExpired => "token_expired",
            GateError::TokenInvalid => "token_invalid",
            GateError::SessionInvalid => "session_invalid",
            GateError::Forbidden(_) => "forbidden",
            GateError::PaymentRequired => "payment_required",
            GateError::NotFound => "not_found",
            GateError::StorageUnavailable(_) => "storage_unavailable",
            GateError::LookupTimeout => "lookup_timeout",
            GateError::BadRequest(_) => "bad_request",
            GateError::Internal(_) => "internal",
        }
    }

    /// Caller-facing text. Expired and invalid tokens share one message.
    pub fn message(&self) -> &'static str {
        match self {
            GateError::Unauthenticated => "authentication required",
            GateError::TokenExpired | GateError::TokenInvalid => "session expired, please log in again",
            GateError::SessionInvalid => "privileged session invalid or expired",
            GateError::Forbidden(_) => "you do not have permission to perform this action",
            GateError::PaymentRequired => "payment is required to access this resource",
            GateError::NotFound => "resource not found",
            GateError::StorageUnavailable(_) => "service temporarily unavailable",
            GateError::LookupTimeout => "access check timed out, please try again",
            GateError::BadRequest(_) => "invalid request",
            GateError::Internal(_) => "internal error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GateError::Unauthenticated
            | GateError::TokenExpired
            | GateError::TokenInvalid
            | GateError::SessionInvalid => 401,
            GateError::Forbidden(_) => 403,
            GateError::PaymentRequired => 402,
            GateError::NotFound => 404,
            GateError::StorageUnavailable(_) | GateError::LookupTimeout => 503,
            GateError::BadRequest(_) => 400,
            GateError::Internal(_) => 500,
        }
    }

    /// True when repeating the same request may succeed without any change by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::LookupTimeout | GateError::StorageUnavailable(_))
    }

    pub fn storage<E: std::fmt::Display>(err: E) -> Self { GateError::StorageUnavailable(err.to_string()) }
}

pub type GateResult<T> = Result<T, GateError>;

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({
            "status": "error",
            "code": self.code(),
            "message": self.message(),
            "retryable": self.is_retryable(),
        });
        if let GateError::Forbidden(reason) = &self {
            body["reason"] = serde_json::json!(reason.as_str());
        }
        (status, Json(body)).into_response()
    }
}
