use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::db::models::{NewUser, NewUserHistory, User, UserFilter};
use crate::db::repository::{UserRepository, UserUnitOfWork};
use crate::error::{AppError, DatabaseError};

const USER_COLUMNS: &str =
    "id, username, email, hashed_password, is_active, is_deleted, is_superuser, dt_created, dt_update";

/// PostgreSQL-backed user repository.
pub struct PgUserRepository {
    pool: Arc<PgPool>,
}

impl PgUserRepository {
    fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self::new(Arc::new(pool)))
    }

    pub async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::QueryError(e.to_string())))?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserUnitOfWork>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UserUnitOfWork for PgUnitOfWork {
    async fn find_by_pk(&mut self, id: Uuid) -> Result<Option<User>, AppError> {
        let sql = format!("SELECT {} FROM users WHERE id = $1 FOR UPDATE", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn find_one(&mut self, filter: &UserFilter) -> Result<Option<User>, AppError> {
        let (column, value) = match filter {
            UserFilter::Email(email) => ("email", email),
            UserFilter::Username(username) => ("username", username),
        };
        let sql = format!(
            "SELECT {} FROM users WHERE lower({}) = lower($1) LIMIT 1 FOR UPDATE",
            USER_COLUMNS, column
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn add(&mut self, user: NewUser) -> Result<User, AppError> {
        let sql = format!(
            r#"
            INSERT INTO users (id, username, email, hashed_password, is_superuser)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.hashed_password)
            .bind(user.is_superuser)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn update(&mut self, user: &User) -> Result<User, AppError> {
        let sql = format!(
            r#"
            UPDATE users
            SET username = $2, email = $3, hashed_password = $4,
                is_active = $5, is_deleted = $6, is_superuser = $7, dt_update = now()
            WHERE id = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let updated = sqlx::query_as::<_, User>(&sql)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.hashed_password)
            .bind(user.is_active)
            .bind(user.is_deleted)
            .bind(user.is_superuser)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(updated)
    }

    async fn remove_by_pk(&mut self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn add_history(&mut self, entries: Vec<NewUserHistory>) -> Result<(), AppError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO user_history (id, user_id, update_field, old_value, new_value) ");
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(Uuid::new_v4())
                .push_bind(entry.user_id)
                .push_bind(entry.update_field)
                .push_bind(entry.old_value)
                .push_bind(entry.new_value);
        });
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
