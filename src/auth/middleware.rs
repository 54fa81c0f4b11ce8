//! Bearer authentication middleware for Axum.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::error::{AuthError, AuthErrorCode};
use super::token::TokenService;
use crate::account::ActorKind;
use crate::core_types::UserId;

/// Authenticated caller, injected into request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub kind: ActorKind,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.kind == ActorKind::Admin
    }
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AuthError::from_code(AuthErrorCode::MissingToken))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::from_code(AuthErrorCode::InvalidFormat))
}

pub async fn bearer_auth(
    State(tokens): State<Arc<TokenService>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let user = tokens.verify_access(bearer_token(request.headers())?)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
