//! Token issue and verification

use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{AuthError, AuthErrorCode};
use super::middleware::AuthUser;
use crate::account::{AccountService, Actor, ActorKind};
use crate::config::JwtConfig;
use crate::core_types::UserId;
use crate::env::Environment;
use crate::error::{CoreError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub user_type: String,
    /// Unix seconds
    pub exp: i64,
    pub iat: i64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

pub struct TokenService {
    env: Environment,
    accounts: Arc<AccountService>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(env: Environment, accounts: Arc<AccountService>, config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is checked against the injected clock
        validation.validate_exp = false;
        Self {
            env,
            accounts,
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            access_ttl: Duration::minutes(config.access_ttl_minutes),
            refresh_ttl: Duration::days(config.refresh_ttl_days),
        }
    }

    fn sign(&self, actor: &Actor, token_type: TokenType, ttl: Duration) -> Result<(String, i64), AuthError> {
        let iat = self.env.now().timestamp();
        let claims = Claims {
            user_id: actor.id,
            user_type: actor.kind.to_string(),
            exp: iat + ttl.num_seconds(),
            iat,
            token_type,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(user_id = actor.id, error = %e, "Token signing failed");
            AuthError::from_code(AuthErrorCode::InternalError)
        })?;
        Ok((token, claims.exp))
    }

    pub fn issue_pair(&self, actor: &Actor) -> Result<TokenPair, AuthError> {
        let (access_token, access_expires_at) = self.sign(actor, TokenType::Access, self.access_ttl)?;
        let (refresh_token, refresh_expires_at) =
            self.sign(actor, TokenType::Refresh, self.refresh_ttl)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Decode, check signature, expiry and type.
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::new(AuthErrorCode::InvalidToken, e.to_string()))?;
        let claims = data.claims;
        if claims.exp <= self.env.now().timestamp() {
            return Err(AuthError::from_code(AuthErrorCode::TokenExpired));
        }
        if claims.token_type != expected {
            return Err(AuthError::from_code(AuthErrorCode::WrongTokenType));
        }
        Ok(claims)
    }

    pub fn verify_access(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = self.verify(token, TokenType::Access)?;
        let kind: ActorKind = claims
            .user_type
            .parse()
            .map_err(|e: String| AuthError::new(AuthErrorCode::InvalidToken, e))?;
        Ok(AuthUser {
            user_id: claims.user_id,
            kind,
        })
    }

    /// Mints a new pair for the actor behind an unexpired refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.verify(refresh_token, TokenType::Refresh)?;
        let actor = self
            .accounts
            .actor(claims.user_id)
            .await
            .map_err(|e| inactive_or_internal(claims.user_id, e))?;
        tracing::info!(user_id = actor.id, "Token pair refreshed");
        self.issue_pair(&actor)
    }
}

fn inactive_or_internal(user_id: UserId, e: CoreError) -> AuthError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::Forbidden => {
            AuthError::from_code(AuthErrorCode::InactiveUser)
        }
        _ => {
            tracing::error!(user_id, error = %e, "Actor lookup failed during refresh");
            AuthError::from_code(AuthErrorCode::InternalError)
        }
    }
}
