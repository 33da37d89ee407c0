use super::{CredentialResult, UserBackend, map_insert_error, migration_statements};
use crate::models::user::User;
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;

const MIGRATION: &str = include_str!("../../../migrations/sqlite/0001_users.sql");

/// SQLite-backed user table, selected with a `sqlite:` database URL.
pub struct SqliteUserBackend {
    pool: SqlitePool,
}

impl SqliteUserBackend {
    /// Open a pool for `url`, creating the database file if missing.
    ///
    /// In-memory databases are per-connection, so they get a single
    /// connection that is never recycled.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }
}

#[async_trait]
impl UserBackend for SqliteUserBackend {
    async fn insert_user(&self, user: &User) -> CredentialResult<()> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, &user.username))?;
        Ok(())
    }

    async fn find_by_username(&self, username: &str) -> CredentialResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn migrate(&self) -> CredentialResult<()> {
        for stmt in migration_statements(MIGRATION) {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn ping(&self) -> CredentialResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
