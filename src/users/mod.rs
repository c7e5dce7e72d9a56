//! Account lifecycle around the session manager: registration, email
//! verification, profile changes and removal.

pub mod handlers;
mod notifier;
mod service;

pub use notifier::{EmailMessage, EmailNotifier, LogNotifier, RedisQueueNotifier};
pub use service::{
    AvailabilityQuery, DeleteRequest, NewAccount, UpdateRequest, UserPatch, UserResponse, UserService,
    VerificationCode, VerifiedField,
};

#[derive(Debug, Clone)]
pub struct UserServiceConfig {
    pub registration_grace: chrono::Duration,
    pub verification_code_length: usize,
    /// Base of the links sent by email, without a trailing slash.
    pub public_url: String,
}
