use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, CacheError};

/// Payload handed to the mail consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub username: String,
    pub email: String,
    pub link: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn send_registration(&self, message: EmailMessage) -> Result<(), AppError>;

    async fn send_email_update(&self, message: EmailMessage) -> Result<(), AppError>;
}

/// Pushes JSON messages onto Redis lists drained by a separate mail worker.
pub struct RedisQueueNotifier {
    manager: ConnectionManager,
    registration_queue: String,
    email_update_queue: String,
}

impl RedisQueueNotifier {
    pub async fn connect(
        url: &str,
        registration_queue: impl Into<String>,
        email_update_queue: impl Into<String>,
    ) -> Result<Self, AppError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            registration_queue: registration_queue.into(),
            email_update_queue: email_update_queue.into(),
        })
    }

    async fn push(&self, queue: &str, message: &EmailMessage) -> Result<(), AppError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| AppError::InternalError(format!("email message encoding failed: {}", e)))?;
        let mut conn = self.manager.clone();
        let _: i64 = conn.rpush(queue, payload).await.map_err(CacheError::from)?;
        info!(queue = queue, username = %message.username, "email message queued");
        Ok(())
    }
}

#[async_trait]
impl EmailNotifier for RedisQueueNotifier {
    async fn send_registration(&self, message: EmailMessage) -> Result<(), AppError> {
        self.push(&self.registration_queue, &message).await
    }

    async fn send_email_update(&self, message: EmailMessage) -> Result<(), AppError> {
        self.push(&self.email_update_queue, &message).await
    }
}

/// Notifier for local runs: records that a message would have been sent.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl EmailNotifier for LogNotifier {
    async fn send_registration(&self, message: EmailMessage) -> Result<(), AppError> {
        info!(username = %message.username, email = %message.email, "registration email not sent (log notifier)");
        Ok(())
    }

    async fn send_email_update(&self, message: EmailMessage) -> Result<(), AppError> {
        info!(username = %message.username, email = %message.email, "email update message not sent (log notifier)");
        Ok(())
    }
}
