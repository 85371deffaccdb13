//! Database query functions for the `users` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Role, User};

/// Insert a new user row and return it.
pub async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    password_hash: &str,
    role: Role,
    now: DateTime<Utc>,
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, password_hash, role, is_active, created_at) \
         VALUES (?, ?, ?, 1, ?) \
         RETURNING *",
    )
    .bind(username)
    .bind(password_hash)
    .bind(role)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert user")?;

    Ok(user)
}

/// Fetch a user by username.
pub async fn get_user_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user")?;

    Ok(user)
}

/// Count all users. Used to decide whether to bootstrap an initial admin.
pub async fn count_users(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("failed to count users")?;

    Ok(row.0)
}
