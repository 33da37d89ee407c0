use super::{CredentialResult, UserBackend, map_insert_error, migration_statements};
use crate::models::user::User;
use async_trait::async_trait;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

const MIGRATION: &str = include_str!("../../../migrations/postgres/0001_users.sql");

/// Postgres-backed user table. This is the production credential store.
pub struct PgUserBackend {
    pool: PgPool,
}

impl PgUserBackend {
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl UserBackend for PgUserBackend {
    async fn insert_user(&self, user: &User) -> CredentialResult<()> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, created_at)
             VALUES ($1, $2, $3, $4, $5)",
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
             FROM users WHERE username = $1",
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
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
