//! Token → principal resolution.
//!
//! Token issuance lives elsewhere; the gateway only needs a verifier.
//! [`JwtIdentity`] checks HS256 bearer tokens, [`StaticIdentity`] is a fixed
//! table for tests and local development.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::room::Principal;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Empty token")]
    Empty,

    #[error("Token rejected: {0}")]
    Rejected(#[from] jsonwebtoken::errors::Error),

    #[error("Unknown token")]
    Unknown,
}

/// Resolves the bearer token presented on connect.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// JWT claims this service reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry, seconds since epoch
    pub exp: u64,
}

/// HS256 JWT verifier.
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityProvider for JwtIdentity {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(IdentityError::Empty);
        }
        let data: TokenData<Claims> = decode(token, &self.key, &self.validation)?;
        let claims = data.claims;
        let display_name = claims.name.unwrap_or_else(|| claims.user_id.to_string());
        Ok(Principal::new(claims.user_id, display_name))
    }
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, Principal>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        self.tokens.insert(token.into(), principal);
    }
}

impl IdentityProvider for StaticIdentity {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(IdentityError::Empty);
        }
        self.tokens.get(token).cloned().ok_or(IdentityError::Unknown)
    }
}

fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    token.strip_prefix("Bearer ").unwrap_or(token).trim()
}
