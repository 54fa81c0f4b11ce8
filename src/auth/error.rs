//! Authentication error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::gateway::types::ApiResponse;

/// Authentication error codes (2001-2009).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthErrorCode {
    /// 2001: No Authorization header
    MissingToken = 2001,
    /// 2002: Header is not `Bearer <token>`
    InvalidFormat = 2002,
    /// 2003: Bad signature or undecodable claims
    InvalidToken = 2003,
    /// 2004: `exp` has passed
    TokenExpired = 2004,
    /// 2005: Refresh token used as access token or the reverse
    WrongTokenType = 2005,
    /// 2006: Actor missing or deactivated
    InactiveUser = 2006,
    /// 2009: Internal server error
    InternalError = 2009,
}

impl AuthErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::WrongTokenType => "WRONG_TOKEN_TYPE",
            Self::InactiveUser => "INACTIVE_USER",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
}

impl AuthError {
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error with the default message for `code`.
    pub fn from_code(code: AuthErrorCode) -> Self {
        let message = match code {
            AuthErrorCode::MissingToken => "Missing Authorization header",
            AuthErrorCode::InvalidFormat => "Invalid Authorization header format",
            AuthErrorCode::InvalidToken => "Invalid token",
            AuthErrorCode::TokenExpired => "Token expired",
            AuthErrorCode::WrongTokenType => "Wrong token type",
            AuthErrorCode::InactiveUser => "User is missing or inactive",
            AuthErrorCode::InternalError => "Internal server error",
        };
        Self::new(code, message)
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.name(), self.message)
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.code.http_status(),
            Json(ApiResponse::<()>::error(self.code.code(), self.message)),
        )
            .into_response()
    }
}
