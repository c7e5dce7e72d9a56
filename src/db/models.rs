use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    /// Email confirmed.
    pub is_active: bool,
    pub is_deleted: bool,
    pub is_superuser: bool,
    pub dt_created: DateTime<Utc>,
    pub dt_update: DateTime<Utc>,
}

impl User {
    /// Unverified and still inside the registration grace window.
    pub fn is_pending(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        !self.is_active && now - self.dt_created < grace
    }

    /// Unverified past the grace window: the registration was abandoned and
    /// the email and username may be claimed again.
    pub fn is_abandoned(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        !self.is_active && !self.is_deleted && now - self.dt_created >= grace
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub hashed_password: String,
    pub is_superuser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    Email(String),
    Username(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub update_field: String,
    pub old_value: String,
    pub new_value: String,
    pub dt_created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserHistory {
    pub user_id: Uuid,
    pub update_field: String,
    pub old_value: String,
    pub new_value: String,
}

impl NewUserHistory {
    pub fn new(user_id: Uuid, field: &str, old_value: impl ToString, new_value: impl ToString) -> Self {
        Self {
            user_id,
            update_field: field.to_string(),
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
        }
    }
}
