//! Gateway types module
//!
//! - [`request`]: request DTOs and the [`ValidatedJson`] extractor
//! - [`response`]: the [`ApiResponse`] envelope, error codes and the
//!   `CoreError` projection

pub mod request;
pub mod response;

pub use request::{ValidatedJson, ValidationRejection, parse_method};
pub use response::{ApiResponse, ApiResult, error_codes, ok};
