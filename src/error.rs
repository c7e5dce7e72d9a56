use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    /// Stable machine-readable code rendered in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthError(e) => e.code(),
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::DatabaseError(DatabaseError::NotFound) => "NOT_FOUND",
            AppError::DatabaseError(DatabaseError::Duplicate) => "DUPLICATE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Domain errors are user-visible; everything else fails closed as an internal error.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Implement conversion from sqlx::Error
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => DatabaseError::Duplicate,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError(err.into())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::TokenInvalidSignature,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if self.is_internal() {
            error!(error = %self, "request failed with internal error");
            "Internal server error".to_string()
        } else {
            match self {
                AppError::AuthError(e) => e.to_string(),
                other => other.to_string(),
            }
        };
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "code": self.code(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
                AuthError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::Duplicate) => StatusCode::BAD_REQUEST,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::CacheError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("User not found")]
    UserNotFound,

    #[error("Incorrect username or password")]
    Unauthorized,

    #[error("Email verification required")]
    NeedEmailVerify,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token signature")]
    TokenInvalidSignature,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("Invalid token type")]
    TokenTypeInvalid,

    #[error("Token owner was deleted")]
    TokenDeleted,

    #[error("Logout tokens do not belong to the same user")]
    TokenLogoutMismatch,

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Email is busy")]
    EmailBusy,

    #[error("Username is busy")]
    UsernameBusy,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Invalid link")]
    InvalidLink,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::UserNotFound => "USER_NOT_FOUND",
            AuthError::Unauthorized => "UNAUTHORIZED",
            AuthError::NeedEmailVerify => "NEED_EMAIL_VERIFY",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::TokenInvalidSignature => "TOKEN_INVALID_SIGNATURE",
            AuthError::TokenInvalid => "TOKEN_INVALID",
            AuthError::TokenTypeInvalid => "TOKEN_TYPE_INVALID",
            AuthError::TokenDeleted => "TOKEN_DELETED",
            AuthError::TokenLogoutMismatch => "TOKEN_LOGOUT_MISMATCH",
            AuthError::TooManyRequests => "TOO_MANY_REQUESTS",
            AuthError::EmailBusy => "EMAIL_BUSY",
            AuthError::UsernameBusy => "USERNAME_BUSY",
            AuthError::InvalidPassword => "INVALID_PASSWORD",
            AuthError::InvalidLink => "INVALID_LINK",
        }
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out acquiring lock {0}")]
    LockTimeout(String),

    #[error("Lock {0} was lost before release")]
    LockLost(String),

    #[error("Corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
