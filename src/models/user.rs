//! A registered account in the credential store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A user record as stored in the `users` table.
///
/// Usernames are unique and compared case-sensitively. Records are created on
/// signup and never modified or deleted by this service.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct User {
    /// Internal identifier, generated on insert.
    pub id: Uuid,

    /// Login name (unique).
    pub username: String,

    /// Contact address given at signup. Not validated.
    pub email: String,

    /// bcrypt hash of the password, including its salt and cost.
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// When the account was created.
    pub created_at: DateTime<Utc>,
}
