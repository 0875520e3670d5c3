//! Group model and CRUD operations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// The public group: every request, authenticated or not, resolves
/// through its folder permissions.
pub const PUBLIC_GROUP_ID: Uuid = Uuid::nil();

/// Group record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created: DateTime<Utc>,
}

impl Group {
    /// Find a group by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let group = sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch group by id")?;

        Ok(group)
    }

    /// Find a group by name.
    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Self>> {
        let group = sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("failed to fetch group by name")?;

        Ok(group)
    }

    /// Create a new group.
    pub async fn create(pool: &PgPool, name: &str, description: &str) -> Result<Self, sqlx::Error> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (id, name, description)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .fetch_one(pool)
        .await
    }

    /// Add a user to this group.
    pub async fn add_member(pool: &PgPool, group_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_groups (user_id, group_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .execute(pool)
        .await
        .context("failed to add group member")?;

        Ok(())
    }
}
