//! Image model: the (source path -> source id) registry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

pub const STATUS_ACTIVE: i16 = 1;
pub const STATUS_DELETED: i16 = 0;

/// Image record. The id is the `source_id` every fingerprint embeds.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub src: String,
    pub folder_id: i64,
    pub status: i16,
    pub width: i32,
    pub height: i32,
    pub created: DateTime<Utc>,
}

impl ImageRecord {
    pub fn is_deleted(&self) -> bool {
        self.status == STATUS_DELETED
    }

    /// Find an image by ID.
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Self>> {
        let image = sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch image by id")?;

        Ok(image)
    }

    /// Find an image by source path.
    pub async fn find_by_src(pool: &PgPool, src: &str) -> Result<Option<Self>> {
        let image = sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE src = $1")
            .bind(src)
            .fetch_optional(pool)
            .await
            .context("failed to fetch image by src")?;

        Ok(image)
    }

    /// Fetch the record for a source path, creating it on first sight.
    pub async fn get_or_create(pool: &PgPool, src: &str, folder_id: i64) -> Result<Self> {
        if let Some(existing) = Self::find_by_src(pool, src).await? {
            return Ok(existing);
        }

        let inserted = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO images (src, folder_id)
            VALUES ($1, $2)
            ON CONFLICT (src) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(src)
        .bind(folder_id)
        .fetch_optional(pool)
        .await
        .context("failed to create image record")?;

        match inserted {
            Some(image) => {
                // On-create audit hook.
                info!(src = %src, id = image.id, "image registered");
                Ok(image)
            }
            // Lost the race; the other writer's row is the answer.
            None => Self::find_by_src(pool, src)
                .await?
                .context("image vanished after conflicting create"),
        }
    }

    /// Record the original's pixel dimensions once known.
    pub async fn set_dimensions(pool: &PgPool, id: i64, width: u32, height: u32) -> Result<()> {
        sqlx::query("UPDATE images SET width = $1, height = $2 WHERE id = $3")
            .bind(width as i32)
            .bind(height as i32)
            .execute(pool)
            .await
            .context("failed to update image dimensions")?;

        Ok(())
    }

    /// Reactivate a record whose file has reappeared on disk.
    pub async fn reactivate(pool: &PgPool, id: i64) -> Result<()> {
        sqlx::query("UPDATE images SET status = $1 WHERE id = $2")
            .bind(STATUS_ACTIVE)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to reactivate image")?;

        Ok(())
    }

    /// Flag an image deleted without removing the row.
    pub async fn mark_deleted(pool: &PgPool, id: i64) -> Result<()> {
        sqlx::query("UPDATE images SET status = $1 WHERE id = $2")
            .bind(STATUS_DELETED)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to mark image deleted")?;

        Ok(())
    }

    /// Remove an image row permanently.
    pub async fn delete(pool: &PgPool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete image")?;

        Ok(())
    }

    /// Images in one folder.
    pub async fn in_folder(pool: &PgPool, folder_id: i64) -> Result<Vec<Self>> {
        let images =
            sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE folder_id = $1 ORDER BY src")
                .bind(folder_id)
                .fetch_all(pool)
                .await
                .context("failed to fetch folder images")?;

        Ok(images)
    }

    /// Update the source path (rename/move).
    pub async fn set_src(pool: &PgPool, id: i64, src: &str, folder_id: i64) -> Result<()> {
        sqlx::query("UPDATE images SET src = $1, folder_id = $2 WHERE id = $3")
            .bind(src)
            .bind(folder_id)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to update image src")?;

        Ok(())
    }
}
