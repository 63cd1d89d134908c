//! Bearer token issuance and verification.
//!
//! Tokens are HS256 JWTs carrying `{username, exp}`. The gate only
//! establishes that a caller holds a valid token; the connection identity
//! still comes from the upgrade path.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// Authentication errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unsupported token algorithm")]
    UnsupportedAlgorithm,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Token signing failed: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm,
            _ => AuthError::Malformed(err.to_string()),
        }
    }
}

/// Claims carried by an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
}

/// Verifies bearer tokens presented before the upgrade.
pub trait IdentityGate: Send + Sync {
    /// Return the username the token was issued to.
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// HS256 token gate.
#[derive(Clone)]
pub struct JwtGate {
    key: DecodingKey,
    validation: Validation,
}

impl JwtGate {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Verify signature and expiry and return the claims.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

impl IdentityGate for JwtGate {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.decode(token).map(|claims| claims.username)
    }
}

/// Issues tokens to the configured users.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    key: EncodingKey,
    ttl: Duration,
    users: HashMap<String, String>,
}

impl TokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration, users: HashMap<String, String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            key: EncodingKey::from_secret(secret.as_ref()),
            ttl,
            users,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.secret,
            Duration::from_secs(config.token_ttl_secs),
            config.users.clone(),
        )
    }

    /// Check credentials and issue a token on success.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let expected = self
            .users
            .get(username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;

        if !self.password_matches(expected, password)? {
            debug!(username, "Rejected login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        self.issue(username)
    }

    /// Sign a token for `username`, valid for the configured TTL.
    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            username: username.to_string(),
            exp: Utc::now().timestamp().saturating_add(ttl),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Constant-time comparison through keyed digests of both passwords.
    fn password_matches(&self, expected: &str, provided: &str) -> Result<bool, AuthError> {
        let expected = self.password_mac(expected)?.finalize().into_bytes();
        Ok(self.password_mac(provided)?.verify_slice(&expected).is_ok())
    }

    fn password_mac(&self, password: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(password.as_bytes());
        Ok(mac)
    }
}
