//! Credential store: user records plus bcrypt password handling.
//!
//! `CredentialStore` owns hashing and the signup/login semantics; the actual
//! rows live behind a `UserBackend`, implemented for Postgres (production)
//! and SQLite (local runs and tests).

mod postgres;
mod sqlite;

pub use postgres::PgUserBackend;
pub use sqlite::SqliteUserBackend;

use crate::models::user::User;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("username `{0}` already exists")]
    DuplicateUsername(String),
    #[error("user `{0}` not found")]
    UserNotFound(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Row-level access to the `users` table.
///
/// Implementations must enforce username uniqueness atomically and report a
/// violation as `CredentialError::DuplicateUsername`.
#[async_trait]
pub trait UserBackend: Send + Sync {
    async fn insert_user(&self, user: &User) -> CredentialResult<()>;

    async fn find_by_username(&self, username: &str) -> CredentialResult<Option<User>>;

    /// Create the schema if it does not exist yet.
    async fn migrate(&self) -> CredentialResult<()>;

    /// Cheap round-trip used by the readiness probe.
    async fn ping(&self) -> CredentialResult<()>;

    async fn close(&self);

    fn name(&self) -> &'static str;
}

/// Signup and login on top of a `UserBackend`.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn UserBackend>,
    bcrypt_cost: u32,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn UserBackend>, bcrypt_cost: u32) -> Self {
        Self {
            backend,
            bcrypt_cost,
        }
    }

    pub fn backend(&self) -> &dyn UserBackend {
        self.backend.as_ref()
    }

    /// Register a new user.
    ///
    /// The password is hashed on the blocking pool before the insert.
    pub async fn create(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> CredentialResult<User> {
        let password_hash = hash_password(password.to_string(), self.bcrypt_cost).await?;
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            created_at: Utc::now(),
        };
        self.backend.insert_user(&user).await?;
        tracing::info!(user_id = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    /// Check a username/password pair and return the matching user.
    pub async fn verify(&self, username: &str, password: &str) -> CredentialResult<User> {
        let user = self
            .backend
            .find_by_username(username)
            .await?
            .ok_or_else(|| CredentialError::UserNotFound(username.to_string()))?;

        if verify_password(password.to_string(), user.password_hash.clone()).await? {
            Ok(user)
        } else {
            Err(CredentialError::InvalidCredentials)
        }
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

async fn hash_password(password: String, cost: u32) -> CredentialResult<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| CredentialError::Hashing(err.to_string()))?
        .map_err(|err| CredentialError::Hashing(err.to_string()))
}

// bcrypt::verify compares the recomputed digest with `subtle::ConstantTimeEq`
// (bcrypt 0.15.1, src/lib.rs `verify`), so the comparison is constant time.
async fn verify_password(password: String, hash: String) -> CredentialResult<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| CredentialError::Hashing(err.to_string()))?
        .map_err(|err| CredentialError::Hashing(err.to_string()))
}

/// Split an embedded migration file into executable statements.
fn migration_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn map_insert_error(err: sqlx::Error, username: &str) -> CredentialError {
    if is_unique_violation(&err) {
        CredentialError::DuplicateUsername(username.to_string())
    } else {
        CredentialError::StoreUnavailable(err)
    }
}
