//! Authentication: token issuance, verification, rotation and revocation,
//! plus the request rate limiter that shares the same cache.

mod extractor;
pub mod handlers;
mod middleware;
mod password;
mod rate_limit;
mod service;
mod token;

pub use extractor::AuthUser;
pub use middleware::RateLimit;
pub use password::PasswordHasher;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use service::{AuthService, Credentials, SessionConfig};
pub use token::{TokenCodec, TokenPair, TokenPayload, TokenType};
