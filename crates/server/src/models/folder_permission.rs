//! Folder permission records: folder x group -> access level.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Folder permission record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FolderPermission {
    pub folder_id: i64,
    pub group_id: Uuid,
    pub access: i16,
}

impl FolderPermission {
    /// Permission rows for one folder restricted to a set of groups.
    pub async fn for_folder(
        pool: &PgPool,
        folder_id: i64,
        group_ids: &[Uuid],
    ) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, FolderPermission>(
            "SELECT * FROM folder_permissions WHERE folder_id = $1 AND group_id = ANY($2)",
        )
        .bind(folder_id)
        .bind(group_ids)
        .fetch_all(pool)
        .await
        .context("failed to fetch folder permissions")?;

        Ok(rows)
    }

    /// Set (or replace) one group's access to one folder.
    pub async fn set(pool: &PgPool, folder_id: i64, group_id: Uuid, access: i16) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folder_permissions (folder_id, group_id, access)
            VALUES ($1, $2, $3)
            ON CONFLICT (folder_id, group_id) DO UPDATE SET access = EXCLUDED.access
            "#,
        )
        .bind(folder_id)
        .bind(group_id)
        .bind(access)
        .execute(pool)
        .await
        .context("failed to set folder permission")?;

        Ok(())
    }

    /// Remove one group's access record from one folder.
    pub async fn remove(pool: &PgPool, folder_id: i64, group_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM folder_permissions WHERE folder_id = $1 AND group_id = $2")
            .bind(folder_id)
            .bind(group_id)
            .execute(pool)
            .await
            .context("failed to remove folder permission")?;

        Ok(())
    }
}
