use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::password::PasswordHasher;
use crate::auth::token::{TokenCodec, TokenPair, TokenPayload, TokenType};
use crate::cache::{with_lock, Cache, CacheSession, LockConfig};
use crate::db::{UserFilter, UserRepository};
use crate::error::{AppError, AuthError};

/// Namespace of the per-user lock shared by refresh and logout.
const REFRESH_LOCK_NAMESPACE: &str = "refresh_token";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    /// How long an unverified registration may still log in with a
    /// "verify your email" answer instead of a plain rejection.
    pub registration_grace: chrono::Duration,
    pub lock: LockConfig,
}

/// Login credentials, identified by either email or username.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Email { email: String, password: String },
    Username { username: String, password: String },
}

impl Credentials {
    fn filter(&self) -> UserFilter {
        match self {
            Credentials::Email { email, .. } => UserFilter::Email(email.clone()),
            Credentials::Username { username, .. } => UserFilter::Username(username.clone()),
        }
    }

    fn password(&self) -> &str {
        match self {
            Credentials::Email { password, .. } | Credentials::Username { password, .. } => password,
        }
    }
}

/// Issues, verifies, rotates and revokes token pairs.
///
/// Token state is never stored as such. A token is active when its signature
/// and expiry check out and the cache says it has not been consumed:
///
/// * refresh tokens are live only while the cache holds an entry keyed by the
///   token string (value: owner id);
/// * access tokens are revoked by a cache entry keyed by the token string,
///   kept until the token would have expired anyway.
///
/// Refresh and logout for one user serialize on the lock
/// `refresh_token:{user_id}`.
pub struct AuthService {
    codec: TokenCodec,
    cache: Arc<dyn Cache>,
    users: Arc<dyn UserRepository>,
    passwords: PasswordHasher,
    config: SessionConfig,
}

impl AuthService {
    pub fn new(
        config: SessionConfig,
        cache: Arc<dyn Cache>,
        users: Arc<dyn UserRepository>,
        passwords: PasswordHasher,
    ) -> Self {
        Self {
            codec: TokenCodec::new(&config.secret, config.algorithm),
            cache,
            users,
            passwords,
            config,
        }
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Result<TokenPair, AppError> {
        let mut uow = self.users.begin().await?;
        let user = uow
            .find_one(&credentials.filter())
            .await?
            .filter(|user| !user.is_deleted)
            .ok_or(AuthError::UserNotFound)?;

        if !self.passwords.verify(credentials.password(), &user.hashed_password).await? {
            warn!(user_id = %user.id, "login rejected: wrong password");
            return Err(AuthError::Unauthorized.into());
        }

        if !user.is_active {
            if user.is_pending(self.config.registration_grace, Utc::now()) {
                return Err(AuthError::NeedEmailVerify.into());
            }
            warn!(user_id = %user.id, "login rejected: registration abandoned");
            return Err(AuthError::Unauthorized.into());
        }

        let (pair, refresh) = self.issue_pair(user.id)?;
        let mut session = CacheSession::begin(self.cache.as_ref());
        session.set(
            pair.refresh_token.as_str(),
            user.id.simple().to_string(),
            Some(refresh.lifetime()),
        );
        session.commit().await?;
        uow.commit().await?;

        info!(user_id = %user.id, "user authenticated");
        Ok(pair)
    }

    /// Check an access token and return its claims.
    ///
    /// The revocation lookup is a plain read: only logout writes that key.
    pub async fn verify_token(&self, access_token: &str) -> Result<TokenPayload, AppError> {
        let payload = self.codec.decode(access_token)?;
        if payload.token_type != TokenType::Access {
            return Err(AuthError::TokenTypeInvalid.into());
        }
        if self.cache.get(access_token).await?.is_some() {
            return Err(AuthError::TokenInvalid.into());
        }
        Ok(payload)
    }

    /// Exchange a refresh token for a new pair. Refresh tokens are single-use.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        let payload = self.codec.decode(refresh_token)?;
        if payload.token_type != TokenType::Refresh {
            return Err(AuthError::TokenTypeInvalid.into());
        }

        let lock = refresh_lock_name(payload.user_id);
        let pair = with_lock(
            self.cache.as_ref(),
            &lock,
            &self.config.lock,
            self.rotate(refresh_token, &payload),
        )
        .await?;

        info!(user_id = %payload.user_id, "token pair refreshed");
        Ok(pair)
    }

    pub async fn logout(&self, user_id: Uuid, tokens: &TokenPair) -> Result<(), AppError> {
        let access = self.codec.decode(&tokens.access_token)?;
        let refresh = self.codec.decode(&tokens.refresh_token)?;
        if access.token_type != TokenType::Access || refresh.token_type != TokenType::Refresh {
            return Err(AuthError::TokenTypeInvalid.into());
        }
        if access.user_id != user_id || refresh.user_id != user_id {
            warn!(user_id = %user_id, "logout rejected: tokens belong to another user");
            return Err(AuthError::TokenLogoutMismatch.into());
        }

        let lock = refresh_lock_name(user_id);
        with_lock(
            self.cache.as_ref(),
            &lock,
            &self.config.lock,
            self.revoke(tokens, &access),
        )
        .await?;

        info!(user_id = %user_id, "user logged out");
        Ok(())
    }

    async fn rotate(&self, refresh_token: &str, payload: &TokenPayload) -> Result<TokenPair, AppError> {
        let mut session = CacheSession::begin(self.cache.as_ref());
        if session.get(refresh_token).await?.is_none() {
            warn!(user_id = %payload.user_id, "refresh rejected: token already consumed");
            return Err(AuthError::TokenInvalid.into());
        }

        let mut uow = self.users.begin().await?;
        let user = uow
            .find_by_pk(payload.user_id)
            .await?
            .filter(|user| !user.is_deleted)
            .ok_or(AuthError::TokenDeleted)?;

        let (pair, refresh) = self.issue_pair(user.id)?;
        session.delete(refresh_token);
        session.set(
            pair.refresh_token.as_str(),
            user.id.simple().to_string(),
            Some(refresh.lifetime()),
        );
        session.commit().await?;
        uow.commit().await?;
        Ok(pair)
    }

    async fn revoke(&self, tokens: &TokenPair, access: &TokenPayload) -> Result<(), AppError> {
        let mut session = CacheSession::begin(self.cache.as_ref());
        if session.get(&tokens.refresh_token).await?.is_none() {
            warn!(user_id = %access.user_id, "logout rejected: session already closed");
            return Err(AuthError::TokenInvalid.into());
        }

        // The token verifies until the end of its `exp` second, so the revocation
        // entry is written even when less than a second is left.
        let ttl = access.remaining(Utc::now()).max(Duration::from_secs(1));
        session.delete(tokens.refresh_token.as_str());
        session.set(tokens.access_token.as_str(), "1", Some(ttl));
        session.commit().await?;
        Ok(())
    }

    fn issue_pair(&self, user_id: Uuid) -> Result<(TokenPair, TokenPayload), AppError> {
        let now = Utc::now();
        let access = TokenPayload::new(user_id, TokenType::Access, now, self.config.access_ttl);
        let refresh = TokenPayload::new(user_id, TokenType::Refresh, now, self.config.refresh_ttl);

        let pair = TokenPair {
            access_token: self.codec.encode(&access)?,
            refresh_token: self.codec.encode(&refresh)?,
        };
        Ok((pair, refresh))
    }
}

fn refresh_lock_name(user_id: Uuid) -> String {
    format!("{}:{}", REFRESH_LOCK_NAMESPACE, user_id.simple())
}
