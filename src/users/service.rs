use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::PasswordHasher;
use crate::cache::{Cache, CacheSession};
use crate::db::{NewUser, NewUserHistory, User, UserFilter, UserRepository, UserUnitOfWork};
use crate::error::{AppError, AuthError, CacheError};
use crate::users::notifier::{EmailMessage, EmailNotifier};
use crate::users::UserServiceConfig;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewAccount {
    #[validate(length(min = 8, max = 39))]
    pub username: String,
    #[validate(email, length(max = 254))]
    pub email: String,
    #[validate(length(min = 8, max = 64))]
    pub password: String,
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AvailabilityQuery {
    Email { email: String },
    Username { username: String },
}

/// Profile change request. Exactly one of `username`, `email` and
/// `new_password` must be present; `password` is the current one.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateRequest {
    #[validate(length(min = 8, max = 39))]
    pub username: Option<String>,
    #[validate(email, length(max = 254))]
    pub email: Option<String>,
    #[validate(length(min = 8, max = 64))]
    pub new_password: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserPatch {
    Username(String),
    Email(String),
    Password(String),
}

impl UpdateRequest {
    pub fn patch(&self) -> Result<UserPatch, AppError> {
        match (&self.username, &self.email, &self.new_password) {
            (Some(username), None, None) => Ok(UserPatch::Username(username.clone())),
            (None, Some(email), None) => Ok(UserPatch::Email(email.clone())),
            (None, None, Some(password)) => Ok(UserPatch::Password(password.clone())),
            _ => Err(AppError::ValidationError(
                "exactly one of username, email or new_password is required".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub is_superuser: bool,
    pub dt_created: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            is_superuser: user.is_superuser,
            dt_created: user.dt_created,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedField {
    IsActive,
    Email,
}

/// One-time code waiting in the cache under the owner's id, together with the
/// change it confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCode {
    pub field: VerifiedField,
    pub value: String,
    pub code: String,
}

impl VerificationCode {
    fn cache_key(user_id: Uuid) -> String {
        user_id.simple().to_string()
    }
}

fn generate_code(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub struct UserService {
    users: Arc<dyn UserRepository>,
    cache: Arc<dyn Cache>,
    notifier: Arc<dyn EmailNotifier>,
    passwords: PasswordHasher,
    config: UserServiceConfig,
}

impl UserService {
    pub fn new(
        config: UserServiceConfig,
        users: Arc<dyn UserRepository>,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn EmailNotifier>,
        passwords: PasswordHasher,
    ) -> Self {
        Self {
            users,
            cache,
            notifier,
            passwords,
            config,
        }
    }

    pub async fn register(&self, account: NewAccount) -> Result<User, AppError> {
        account.validate()?;
        let now = Utc::now();

        let mut uow = self.users.begin().await?;
        self.claim(uow.as_mut(), UserFilter::Email(account.email.clone()), None, now)
            .await?;
        self.claim(uow.as_mut(), UserFilter::Username(account.username.clone()), None, now)
            .await?;

        let user = uow
            .add(NewUser {
                username: account.username,
                email: account.email,
                hashed_password: self.passwords.hash(&account.password).await?,
                is_superuser: account.is_superuser,
            })
            .await?;

        uow.commit().await?;

        // The link is only sent for an account that was actually stored.
        if let Err(err) = self.send_registration_link(&user).await {
            error!(user_id = %user.id, error = %err, "registration email failed, discarding account");
            if let Err(discard_err) = self.discard_registration(user.id).await {
                error!(user_id = %user.id, error = %discard_err, "failed to discard unannounced registration");
            }
            return Err(err);
        }

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    async fn send_registration_link(&self, user: &User) -> Result<(), AppError> {
        let link = self
            .store_code(user.id, VerifiedField::IsActive, "true".to_string())
            .await?;
        self.notifier
            .send_registration(EmailMessage {
                username: user.username.clone(),
                email: user.email.clone(),
                link,
            })
            .await
    }

    async fn discard_registration(&self, user_id: Uuid) -> Result<(), AppError> {
        let mut session = CacheSession::begin(self.cache.as_ref());
        session.delete(VerificationCode::cache_key(user_id));
        session.commit().await?;

        let mut uow = self.users.begin().await?;
        uow.remove_by_pk(user_id).await?;
        uow.commit().await
    }

    /// Confirm the change a verification link was issued for.
    pub async fn verify_email(&self, user_id: Uuid, code: &str) -> Result<(), AppError> {
        let key = VerificationCode::cache_key(user_id);
        let mut session = CacheSession::begin(self.cache.as_ref());
        let pending: VerificationCode = match session.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| CacheError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?,
            None => return Err(AuthError::InvalidLink.into()),
        };
        if pending.code != code {
            warn!(user_id = %user_id, "verification rejected: code mismatch");
            return Err(AuthError::InvalidLink.into());
        }

        let mut uow = self.users.begin().await?;
        let mut user = uow
            .find_by_pk(user_id)
            .await?
            .filter(|user| !user.is_deleted)
            .ok_or(AuthError::InvalidLink)?;

        let change = match pending.field {
            VerifiedField::IsActive => {
                if user.is_active {
                    return Err(AuthError::InvalidLink.into());
                }
                user.is_active = true;
                NewUserHistory::new(user.id, "is_active", false, true)
            }
            VerifiedField::Email => {
                if user.email.eq_ignore_ascii_case(&pending.value) {
                    return Err(AuthError::InvalidLink.into());
                }
                self.claim(uow.as_mut(), UserFilter::Email(pending.value.clone()), Some(user.id), Utc::now())
                    .await?;
                let change = NewUserHistory::new(user.id, "email", &user.email, &pending.value);
                user.email = pending.value;
                change
            }
        };

        uow.update(&user).await?;
        uow.add_history(vec![change]).await?;
        session.delete(key);
        session.commit().await?;
        uow.commit().await?;

        info!(user_id = %user_id, field = ?pending.field, "verification link consumed");
        Ok(())
    }

    /// Whether a registration could claim this email or username right now.
    pub async fn available(&self, query: &AvailabilityQuery) -> Result<bool, AppError> {
        let filter = match query {
            AvailabilityQuery::Email { email } => UserFilter::Email(email.clone()),
            AvailabilityQuery::Username { username } => UserFilter::Username(username.clone()),
        };
        let mut uow = self.users.begin().await?;
        let existing = uow.find_one(&filter).await?;
        uow.rollback().await?;

        let grace = self.config.registration_grace;
        Ok(existing.map_or(true, |user| user.is_abandoned(grace, Utc::now())))
    }

    pub async fn me(&self, user_id: Uuid) -> Result<UserResponse, AppError> {
        let mut uow = self.users.begin().await?;
        let user = uow
            .find_by_pk(user_id)
            .await?
            .filter(|user| !user.is_deleted)
            .ok_or(AuthError::TokenDeleted)?;
        uow.rollback().await?;
        Ok(user.into())
    }

    /// Apply a profile change. Email changes only take effect once the new
    /// address is verified; the returned profile still shows the old one.
    pub async fn update(&self, user_id: Uuid, request: UpdateRequest) -> Result<UserResponse, AppError> {
        request.validate()?;
        let patch = request.patch()?;

        let mut uow = self.users.begin().await?;
        let mut user = self.authorize(uow.as_mut(), user_id, &request.password).await?;
        let mut new_email = None;

        match patch {
            UserPatch::Username(username) => {
                self.claim(uow.as_mut(), UserFilter::Username(username.clone()), Some(user.id), Utc::now())
                    .await?;
                let change = NewUserHistory::new(user.id, "username", &user.username, &username);
                user.username = username;
                user = uow.update(&user).await?;
                uow.add_history(vec![change]).await?;
            }
            UserPatch::Email(email) => {
                self.claim(uow.as_mut(), UserFilter::Email(email.clone()), Some(user.id), Utc::now())
                    .await?;
                new_email = Some(email);
            }
            UserPatch::Password(new_password) => {
                let hashed = self.passwords.hash(&new_password).await?;
                let change = NewUserHistory::new(user.id, "hashed_password", &user.hashed_password, &hashed);
                user.hashed_password = hashed;
                user = uow.update(&user).await?;
                uow.add_history(vec![change]).await?;
            }
        }
        uow.commit().await?;

        if let Some(email) = new_email {
            let link = self.store_code(user.id, VerifiedField::Email, email.clone()).await?;
            self.notifier
                .send_email_update(EmailMessage {
                    username: user.username.clone(),
                    email,
                    link,
                })
                .await?;
        }

        info!(user_id = %user_id, "user updated");
        Ok(user.into())
    }

    /// Soft delete. Outstanding refresh tokens stop working.
    pub async fn delete(&self, user_id: Uuid, request: &DeleteRequest) -> Result<(), AppError> {
        let mut uow = self.users.begin().await?;
        let mut user = self.authorize(uow.as_mut(), user_id, &request.password).await?;

        user.is_deleted = true;
        uow.update(&user).await?;
        uow.add_history(vec![NewUserHistory::new(user.id, "is_deleted", false, true)])
            .await?;
        uow.commit().await?;

        info!(user_id = %user_id, "user deleted");
        Ok(())
    }

    /// Load a live user and check their current password.
    async fn authorize(&self, uow: &mut dyn UserUnitOfWork, user_id: Uuid, password: &str) -> Result<User, AppError> {
        let user = uow
            .find_by_pk(user_id)
            .await?
            .filter(|user| !user.is_deleted)
            .ok_or(AuthError::TokenDeleted)?;
        if !self.passwords.verify(password, &user.hashed_password).await? {
            warn!(user_id = %user_id, "password check failed");
            return Err(AuthError::InvalidPassword.into());
        }
        Ok(user)
    }

    /// Make sure the email or username in `filter` is free for `owner` (or for a
    /// new account when `owner` is `None`). An abandoned registration holding
    /// it is removed.
    async fn claim(
        &self,
        uow: &mut dyn UserUnitOfWork,
        filter: UserFilter,
        owner: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let busy = match filter {
            UserFilter::Email(_) => AuthError::EmailBusy,
            UserFilter::Username(_) => AuthError::UsernameBusy,
        };
        let existing = match uow.find_one(&filter).await? {
            Some(existing) if Some(existing.id) != owner => existing,
            _ => return Ok(()),
        };

        if existing.is_abandoned(self.config.registration_grace, now) {
            info!(user_id = %existing.id, "superseding abandoned registration");
            uow.remove_by_pk(existing.id).await?;
            Ok(())
        } else {
            Err(busy.into())
        }
    }

    /// Store a fresh one-time code for `user_id` and return the link carrying it.
    async fn store_code(&self, user_id: Uuid, field: VerifiedField, value: String) -> Result<String, AppError> {
        let code = generate_code(self.config.verification_code_length);
        let pending = VerificationCode {
            field,
            value,
            code: code.clone(),
        };
        let encoded = serde_json::to_string(&pending)
            .map_err(|e| AppError::InternalError(format!("verification code encoding failed: {}", e)))?;

        let mut session = CacheSession::begin(self.cache.as_ref());
        session.set(
            VerificationCode::cache_key(user_id),
            encoded,
            self.config.registration_grace.to_std().ok(),
        );
        session.commit().await?;

        Ok(format!(
            "{}/v1/user/registration/verify/{}/{}",
            self.config.public_url,
            user_id.simple(),
            code
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::MemoryUserRepository;
    use crate::users::notifier::MockEmailNotifier;
    use futures::FutureExt;
    use mockall::predicate::function;

    const PASSWORD: &str = "pw123456";

    struct Fixture {
        service: UserService,
        cache: MemoryCache,
        users: MemoryUserRepository,
    }

    fn config(grace_secs: i64) -> UserServiceConfig {
        UserServiceConfig {
            registration_grace: chrono::Duration::seconds(grace_secs),
            verification_code_length: 16,
            public_url: "http://accounts.test".into(),
        }
    }

    fn fixture_with(config: UserServiceConfig, notifier: MockEmailNotifier) -> Fixture {
        let cache = MemoryCache::new();
        let users = MemoryUserRepository::new();
        let service = UserService::new(
            config,
            Arc::new(users.clone()),
            Arc::new(cache.clone()),
            Arc::new(notifier),
            PasswordHasher::new(64, 1).unwrap(),
        );
        Fixture { service, cache, users }
    }

    fn quiet_notifier() -> MockEmailNotifier {
        let mut notifier = MockEmailNotifier::new();
        notifier.expect_send_registration().returning(|_| Ok(()));
        notifier.expect_send_email_update().returning(|_| Ok(()));
        notifier
    }

    fn fixture() -> Fixture {
        fixture_with(config(60), quiet_notifier())
    }

    fn account(username: &str, email: &str) -> NewAccount {
        NewAccount {
            username: username.into(),
            email: email.into(),
            password: PASSWORD.into(),
            is_superuser: false,
        }
    }

    fn auth_kind<T: std::fmt::Debug>(result: Result<T, AppError>) -> AuthError {
        match result {
            Err(AppError::AuthError(kind)) => kind,
            other => panic!("expected an auth error, got {:?}", other),
        }
    }

    impl Fixture {
        async fn pending_code(&self, user_id: Uuid) -> VerificationCode {
            let raw = self.cache.get(&VerificationCode::cache_key(user_id)).await.unwrap().unwrap();
            serde_json::from_str(&raw).unwrap()
        }

        async fn registered(&self, username: &str, email: &str) -> User {
            let user = self.service.register(account(username, email)).await.unwrap();
            let code = self.pending_code(user.id).await.code;
            self.service.verify_email(user.id, &code).await.unwrap();
            user
        }
    }

    #[tokio::test]
    async fn test_register_sends_link_with_stored_code() {
        let mut notifier = MockEmailNotifier::new();
        notifier
            .expect_send_registration()
            .with(function(|m: &EmailMessage| {
                m.email == "a@x.com" && m.link.starts_with("http://accounts.test/v1/user/registration/verify/")
            }))
            .times(1)
            .returning(|_| Ok(()));
        let f = fixture_with(config(60), notifier);

        let user = f.service.register(account("alice_wonder", "a@x.com")).await.unwrap();
        assert!(!user.is_active);
        assert_ne!(user.hashed_password, PASSWORD);

        let pending = f.pending_code(user.id).await;
        assert_eq!(pending.field, VerifiedField::IsActive);
        assert_eq!(pending.code.len(), 16);
        assert!(pending.code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(f.cache.ttl(&VerificationCode::cache_key(user.id)).await.unwrap() <= std::time::Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let f = fixture();
        let short = f.service.register(account("alice", "a@x.com")).await;
        assert!(matches!(short, Err(AppError::ValidationError(_))));

        let bad_email = f.service.register(account("alice_wonder", "not-an-email")).await;
        assert!(matches!(bad_email, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_register_accepts_long_email() {
        let f = fixture();
        let email = format!("{}@{}.{}.com", "a".repeat(60), "b".repeat(60), "c".repeat(60));
        assert!(email.len() > 150);

        let user = f.service.register(account("alice_wonder", &email)).await.unwrap();
        assert_eq!(user.email, email);

        // The column must hold every address the validator accepts
        let schema = include_str!("../../migrations/20240101000000_create_users.sql");
        assert!(schema.contains("email VARCHAR(254)"));
    }

    #[tokio::test]
    async fn test_register_duplicates_within_grace() {
        let f = fixture();
        f.service.register(account("alice_wonder", "a@x.com")).await.unwrap();

        assert_eq!(
            auth_kind(f.service.register(account("another_name", "A@x.com")).await),
            AuthError::EmailBusy
        );
        assert_eq!(
            auth_kind(f.service.register(account("alice_wonder", "b@x.com")).await),
            AuthError::UsernameBusy
        );
        assert_eq!(f.users.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_registration_is_superseded() {
        let f = fixture_with(config(0), quiet_notifier());
        let first = f.service.register(account("alice_wonder", "a@x.com")).await.unwrap();
        let second = f.service.register(account("another_name", "a@x.com")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(f.users.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_rolls_back_registration() {
        let mut notifier = MockEmailNotifier::new();
        notifier
            .expect_send_registration()
            .returning(|_| Err(AppError::InternalError("queue down".into())));
        let f = fixture_with(config(60), notifier);

        assert!(f.service.register(account("alice_wonder", "a@x.com")).await.is_err());
        assert_eq!(f.users.user_count().await, 0);
        assert!(f.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_registration_link_sent_after_commit() {
        let users = MemoryUserRepository::new();
        let observed = users.clone();
        let mut notifier = MockEmailNotifier::new();
        notifier
            .expect_send_registration()
            .times(1)
            .returning(move |_| {
                // The unit of work holds the table lock until it commits
                assert_eq!(observed.user_count().now_or_never(), Some(1));
                Ok(())
            });
        let service = UserService::new(
            config(60),
            Arc::new(users.clone()),
            Arc::new(MemoryCache::new()),
            Arc::new(notifier),
            PasswordHasher::new(64, 1).unwrap(),
        );

        service.register(account("alice_wonder", "a@x.com")).await.unwrap();
        assert_eq!(users.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_verify_email_activates_once() {
        let f = fixture();
        let user = f.service.register(account("alice_wonder", "a@x.com")).await.unwrap();
        let code = f.pending_code(user.id).await.code;

        assert_eq!(
            auth_kind(f.service.verify_email(user.id, "wrong").await),
            AuthError::InvalidLink
        );
        f.service.verify_email(user.id, &code).await.unwrap();
        assert_eq!(
            auth_kind(f.service.verify_email(user.id, &code).await),
            AuthError::InvalidLink
        );

        let history = f.users.history_for(user.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].update_field, "is_active");
    }

    #[tokio::test]
    async fn test_available() {
        let f = fixture();
        f.registered("alice_wonder", "a@x.com").await;

        let email = |e: &str| AvailabilityQuery::Email { email: e.into() };
        let username = |u: &str| AvailabilityQuery::Username { username: u.into() };
        assert!(!f.service.available(&email("a@x.com")).await.unwrap());
        assert!(f.service.available(&email("b@x.com")).await.unwrap());
        assert!(!f.service.available(&username("ALICE_WONDER")).await.unwrap());
        assert!(f.service.available(&username("bobby_builder")).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_username_and_password() {
        let f = fixture();
        let user = f.registered("alice_wonder", "a@x.com").await;
        f.registered("bobby_builder", "b@x.com").await;

        let request = |username: Option<&str>, new_password: Option<&str>, password: &str| UpdateRequest {
            username: username.map(Into::into),
            email: None,
            new_password: new_password.map(Into::into),
            password: password.into(),
        };

        assert_eq!(
            auth_kind(f.service.update(user.id, request(Some("alice_renamed"), None, "wrong-pass")).await),
            AuthError::InvalidPassword
        );
        assert_eq!(
            auth_kind(f.service.update(user.id, request(Some("bobby_builder"), None, PASSWORD)).await),
            AuthError::UsernameBusy
        );

        let updated = f
            .service
            .update(user.id, request(Some("alice_renamed"), None, PASSWORD))
            .await
            .unwrap();
        assert_eq!(updated.username, "alice_renamed");

        f.service
            .update(user.id, request(None, Some("new-password"), PASSWORD))
            .await
            .unwrap();
        assert_eq!(
            auth_kind(f.service.update(user.id, request(Some("alice_again"), None, PASSWORD)).await),
            AuthError::InvalidPassword
        );
    }

    #[tokio::test]
    async fn test_update_requires_single_change() {
        let f = fixture();
        let user = f.registered("alice_wonder", "a@x.com").await;
        let request = UpdateRequest {
            username: Some("alice_renamed".into()),
            email: Some("c@x.com".into()),
            new_password: None,
            password: PASSWORD.into(),
        };
        assert!(matches!(
            f.service.update(user.id, request).await,
            Err(AppError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_email_change_applies_after_verification() {
        let f = fixture();
        let user = f.registered("alice_wonder", "a@x.com").await;

        let request = UpdateRequest {
            username: None,
            email: Some("c@x.com".into()),
            new_password: None,
            password: PASSWORD.into(),
        };
        let response = f.service.update(user.id, request).await.unwrap();
        assert_eq!(response.email, "a@x.com");

        let pending = f.pending_code(user.id).await;
        assert_eq!(pending.field, VerifiedField::Email);
        assert_eq!(pending.value, "c@x.com");

        f.service.verify_email(user.id, &pending.code).await.unwrap();
        assert_eq!(f.service.me(user.id).await.unwrap().email, "c@x.com");
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_final() {
        let f = fixture();
        let user = f.registered("alice_wonder", "a@x.com").await;

        let wrong = DeleteRequest {
            password: "wrong-pass".into(),
        };
        assert_eq!(auth_kind(f.service.delete(user.id, &wrong).await), AuthError::InvalidPassword);

        let request = DeleteRequest {
            password: PASSWORD.into(),
        };
        f.service.delete(user.id, &request).await.unwrap();
        assert_eq!(f.users.user_count().await, 1);
        assert_eq!(auth_kind(f.service.me(user.id).await), AuthError::TokenDeleted);
        assert_eq!(auth_kind(f.service.delete(user.id, &request).await), AuthError::TokenDeleted);
    }
}
