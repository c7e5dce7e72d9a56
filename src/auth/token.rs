//! Signed token codec.
//!
//! Tokens are compact JWTs (`header.payload.signature`) signed with a shared
//! HMAC secret. The codec is pure: it never touches the cache or the clock of
//! another instance, so it can be shared freely between tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AuthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "access_token")]
    Access,
    #[serde(rename = "refresh_token")]
    Refresh,
}

/// Claims embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(with = "uuid::serde::simple")]
    pub user_id: Uuid,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token, so two tokens minted in the same second differ.
    #[serde(with = "uuid::serde::simple")]
    pub jti: Uuid,
}

impl TokenPayload {
    pub fn new(user_id: Uuid, token_type: TokenType, issued_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        let iat = issued_at.timestamp();
        Self {
            user_id,
            token_type,
            iat,
            exp: iat + ttl.num_seconds().max(1),
            jti: Uuid::new_v4(),
        }
    }

    /// Full validity window of the token.
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs((self.exp - self.iat).max(0) as u64)
    }

    /// How long the codec keeps accepting the token after `now`; zero once
    /// expired. Expiry is checked in whole seconds and `exp` itself is still
    /// accepted, so the window runs to the end of that second.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_secs((self.exp + 1 - now.timestamp()).max(0) as u64)
    }
}

/// Access and refresh tokens issued together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TokenCodec {
    header: Header,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &str, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat"]);

        Self {
            header: Header::new(algorithm),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn encode(&self, payload: &TokenPayload) -> Result<String, AppError> {
        encode(&self.header, payload, &self.encoding_key)
            .map_err(|e| AppError::InternalError(format!("token encoding failed: {}", e)))
    }

    /// Verify the signature and expiry and return the claims.
    pub fn decode(&self, token: &str) -> Result<TokenPayload, AuthError> {
        let data = decode::<TokenPayload>(token, &self.decoding_key, &self.validation)?;

        let payload = data.claims;
        if payload.exp <= payload.iat {
            return Err(AuthError::TokenInvalidSignature);
        }
        Ok(payload)
    }
}
