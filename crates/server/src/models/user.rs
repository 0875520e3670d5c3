//! User model and CRUD operations.
//!
//! Identity is managed elsewhere; the server keeps only what the
//! permission oracle and the API token middleware need.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// User record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub mail: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub is_admin: bool,
    pub status: i16,
    pub created: DateTime<Utc>,
}

/// Input for creating a new user.
#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub mail: String,
    pub is_admin: bool,
}

impl User {
    /// Check if this user is active.
    pub fn is_active(&self) -> bool {
        self.status == 1
    }

    /// Find a user by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch user by id")?;

        Ok(user)
    }

    /// Find a user by API token.
    pub async fn find_by_token(pool: &PgPool, token: &str) -> Result<Option<Self>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE api_token = $1 AND status = 1",
        )
        .bind(token)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by token")?;

        Ok(user)
    }

    /// Create a new user.
    pub async fn create(pool: &PgPool, input: CreateUser) -> Result<Self, sqlx::Error> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, mail, is_admin)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.mail)
        .bind(input.is_admin)
        .fetch_one(pool)
        .await
    }

    /// The IDs of every group this user belongs to.
    pub async fn group_ids(pool: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT group_id FROM user_groups WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to fetch user groups")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
