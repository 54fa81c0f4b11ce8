//! Token authentication
//!
//! HS256 bearer tokens carrying `{user_id, user_type, exp, iat, type}`.
//!
//! ## Components
//! - `token`: issue, verify and refresh token pairs
//! - `error`: authentication error codes (2001-2009)
//! - `middleware`: Axum bearer middleware injecting [`AuthUser`]

pub mod error;
pub mod middleware;
pub mod token;

pub use error::{AuthError, AuthErrorCode};
pub use middleware::{AuthUser, bearer_auth, bearer_token};
pub use token::{Claims, TokenPair, TokenService, TokenType};
