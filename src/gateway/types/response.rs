//! API Response types and error codes
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `error_codes`: Standard error code constants
//! - `IntoResponse` for [`CoreError`]: deterministic kind to status mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::{CoreError, ErrorKind};

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or null (error)
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, CoreError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Standard API error codes
pub mod error_codes {
    use crate::error::ErrorKind;

    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INSUFFICIENT_FUNDS: i32 = 1002;
    pub const SIGNATURE_MISMATCH: i32 = 1003;
    pub const AMOUNT_MISMATCH: i32 = 1004;

    // Resource errors (4xxx)
    pub const FORBIDDEN: i32 = 4003;
    pub const NOT_FOUND: i32 = 4004;
    pub const CONFLICTING_TRANSITION: i32 = 4009;
    pub const ALREADY_TERMINAL: i32 = 4010;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const GATEWAY_FAILURE: i32 = 5002;

    pub fn for_kind(kind: ErrorKind) -> i32 {
        match kind {
            ErrorKind::Validation => INVALID_PARAMETER,
            ErrorKind::NotFound => NOT_FOUND,
            ErrorKind::Forbidden => FORBIDDEN,
            ErrorKind::ConflictingTransition => CONFLICTING_TRANSITION,
            ErrorKind::InsufficientFunds => INSUFFICIENT_FUNDS,
            ErrorKind::SignatureMismatch => SIGNATURE_MISMATCH,
            ErrorKind::AmountMismatch => AMOUNT_MISMATCH,
            ErrorKind::GatewayFailure => GATEWAY_FAILURE,
            ErrorKind::AlreadyTerminal => ALREADY_TERMINAL,
            ErrorKind::Internal => INTERNAL_ERROR,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let msg = match self.kind() {
            ErrorKind::Internal => {
                tracing::error!(error = %self, "Internal error reached the API edge");
                "INTERNAL_ERROR: internal error".to_string()
            }
            _ => format!("{}: {}", self.code(), self),
        };
        let body = ApiResponse::<()>::error(error_codes::for_kind(self.kind()), msg);
        (status, Json(body)).into_response()
    }
}
