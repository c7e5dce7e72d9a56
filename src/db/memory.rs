use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::models::{NewUser, NewUserHistory, User, UserFilter, UserHistory};
use crate::db::repository::{UserRepository, UserUnitOfWork};
use crate::error::{AppError, DatabaseError};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    history: Vec<UserHistory>,
}

impl Tables {
    fn conflicts(&self, candidate: &User) -> bool {
        self.users.values().any(|existing| {
            existing.id != candidate.id
                && (existing.email.eq_ignore_ascii_case(&candidate.email)
                    || existing.username.eq_ignore_ascii_case(&candidate.username))
        })
    }
}

/// In-process user store with serialized transactions.
///
/// A unit of work holds the table lock for its whole lifetime and edits a
/// private copy, which replaces the tables on commit.
#[derive(Clone, Default)]
pub struct MemoryUserRepository {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_for(&self, user_id: Uuid) -> Vec<UserHistory> {
        let tables = self.tables.lock().await;
        tables
            .history
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserUnitOfWork>, AppError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl UserUnitOfWork for MemoryUnitOfWork {
    async fn find_by_pk(&mut self, id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn find_one(&mut self, filter: &UserFilter) -> Result<Option<User>, AppError> {
        let found = self.working.users.values().find(|user| match filter {
            UserFilter::Email(email) => user.email.eq_ignore_ascii_case(email),
            UserFilter::Username(username) => user.username.eq_ignore_ascii_case(username),
        });
        Ok(found.cloned())
    }

    async fn add(&mut self, user: NewUser) -> Result<User, AppError> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            hashed_password: user.hashed_password,
            is_active: false,
            is_deleted: false,
            is_superuser: user.is_superuser,
            dt_created: now,
            dt_update: now,
        };
        if self.working.conflicts(&user) {
            return Err(DatabaseError::Duplicate.into());
        }
        self.working.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update(&mut self, user: &User) -> Result<User, AppError> {
        if !self.working.users.contains_key(&user.id) {
            return Err(DatabaseError::NotFound.into());
        }
        if self.working.conflicts(user) {
            return Err(DatabaseError::Duplicate.into());
        }
        let mut updated = user.clone();
        updated.dt_update = Utc::now();
        self.working.users.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn remove_by_pk(&mut self, id: Uuid) -> Result<(), AppError> {
        self.working.users.remove(&id);
        self.working.history.retain(|entry| entry.user_id != id);
        Ok(())
    }

    async fn add_history(&mut self, entries: Vec<NewUserHistory>) -> Result<(), AppError> {
        let now = Utc::now();
        self.working.history.extend(entries.into_iter().map(|entry| UserHistory {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            update_field: entry.update_field,
            old_value: entry.old_value,
            new_value: entry.new_value,
            dt_created: now,
        }));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}
