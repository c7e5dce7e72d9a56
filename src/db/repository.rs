use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::{NewUser, NewUserHistory, User, UserFilter};
use crate::error::AppError;

/// Source of user units of work.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UserUnitOfWork>, AppError>;
}

/// One transaction over the user tables.
///
/// Reads lock the returned rows until the unit of work ends. Dropping a unit
/// of work without calling [`UserUnitOfWork::commit`] rolls it back.
#[async_trait]
pub trait UserUnitOfWork: Send {
    async fn find_by_pk(&mut self, id: Uuid) -> Result<Option<User>, AppError>;

    /// Case-insensitive equality lookup on email or username.
    async fn find_one(&mut self, filter: &UserFilter) -> Result<Option<User>, AppError>;

    async fn add(&mut self, user: NewUser) -> Result<User, AppError>;

    async fn update(&mut self, user: &User) -> Result<User, AppError>;

    async fn remove_by_pk(&mut self, id: Uuid) -> Result<(), AppError>;

    async fn add_history(&mut self, entries: Vec<NewUserHistory>) -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}
