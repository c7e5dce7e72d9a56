//! Argon2id password hashing.
//!
//! Hashes are stored as PHC strings, so parameters and salt travel with the
//! hash and stored credentials survive a change of the configured cost.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::AppError;

#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, AppError> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| AppError::ConfigError(format!("argon2 parameters: {}", e)))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hashing runs on the blocking pool so it never stalls an actix worker.
    pub async fn hash(&self, password: &str) -> Result<String, AppError> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        run_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            let hash = argon2
                .hash_password(password.as_bytes(), &salt)
                .map_err(|e| AppError::InternalError(format!("password hashing failed: {}", e)))?;
            Ok(hash.to_string())
        })
        .await
    }

    /// `Ok(false)` on mismatch; `Err` only when the stored hash is unreadable.
    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        run_blocking(move || {
            let parsed = PasswordHash::new(&hash)
                .map_err(|e| AppError::InternalError(format!("stored password hash is malformed: {}", e)))?;
            match argon2.verify_password(password.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(argon2::password_hash::Error::Password) => Ok(false),
                Err(e) => Err(AppError::InternalError(format!("password verification failed: {}", e))),
            }
        })
        .await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AppError::InternalError(format!("password task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(64, 1).unwrap()
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("pw123456").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("pw123456", &hash).await.unwrap());
        assert!(!hasher.verify("pw1234567", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_verifies_under_other_params() {
        let hash = hasher().hash("pw123456").await.unwrap();
        let stronger = PasswordHasher::new(128, 2).unwrap();
        assert!(stronger.verify("pw123456", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_hash_is_internal() {
        assert!(matches!(hasher().verify("pw", "plain").await, Err(AppError::InternalError(_))));
    }

    #[test]
    fn test_invalid_params() {
        assert!(PasswordHasher::new(1, 0).is_err());
    }
}
