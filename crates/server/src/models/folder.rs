//! Folder model.
//!
//! Folders form a tree, but rows hold only a `parent_id`; parents and
//! children are always reached by lookup, never as owned pointers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::storage::normalise_path;

pub const STATUS_ACTIVE: i16 = 1;
pub const STATUS_DELETED: i16 = 0;

/// Folder record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    /// Normalised path relative to the images root; the root folder is "".
    pub path: String,
    pub parent_id: Option<i64>,
    pub status: i16,
    pub created: DateTime<Utc>,
}

impl Folder {
    pub fn is_deleted(&self) -> bool {
        self.status == STATUS_DELETED
    }

    /// Find a folder by ID.
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Self>> {
        let folder = sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch folder by id")?;

        Ok(folder)
    }

    /// Find a folder by its normalised path.
    pub async fn find_by_path(pool: &PgPool, path: &str) -> Result<Option<Self>> {
        let folder = sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE path = $1")
            .bind(normalise_path(path))
            .fetch_optional(pool)
            .await
            .context("failed to fetch folder by path")?;

        Ok(folder)
    }

    /// The root folder.
    pub async fn root(pool: &PgPool) -> Result<Self> {
        let folder = sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE path = ''")
            .fetch_one(pool)
            .await
            .context("root folder missing")?;

        Ok(folder)
    }

    /// Direct children of a folder.
    pub async fn children(pool: &PgPool, id: i64) -> Result<Vec<Self>> {
        let folders =
            sqlx::query_as::<_, Folder>("SELECT * FROM folders WHERE parent_id = $1 ORDER BY path")
                .bind(id)
                .fetch_all(pool)
                .await
                .context("failed to fetch folder children")?;

        Ok(folders)
    }

    /// Create one folder under an existing parent. Unique-key conflicts
    /// surface as `sqlx::Error` for the caller to translate.
    pub async fn create(pool: &PgPool, path: &str, parent_id: i64) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Folder>(
            r#"
            INSERT INTO folders (path, parent_id)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(normalise_path(path))
        .bind(parent_id)
        .fetch_one(pool)
        .await
    }

    /// Walk a path from the root, creating any missing ancestors, and
    /// return the folder for the full path.
    pub async fn ensure_chain(pool: &PgPool, path: &str) -> Result<Self> {
        let normalised = normalise_path(path);
        let mut current = Self::root(pool).await?;
        if normalised.is_empty() {
            return Ok(current);
        }

        let mut so_far = String::new();
        for segment in normalised.split('/') {
            if !so_far.is_empty() {
                so_far.push('/');
            }
            so_far.push_str(segment);

            current = match Self::find_by_path(pool, &so_far).await? {
                Some(folder) => folder,
                None => match Self::create(pool, &so_far, current.id).await {
                    Ok(folder) => folder,
                    // A concurrent creator can win the insert; re-read.
                    Err(e) if is_unique_violation(&e) => Self::find_by_path(pool, &so_far)
                        .await?
                        .context("folder vanished after conflicting create")?,
                    Err(e) => return Err(e).context("failed to create folder"),
                },
            };
        }

        Ok(current)
    }

    /// Flag a folder deleted without removing the row.
    pub async fn mark_deleted(pool: &PgPool, id: i64) -> Result<()> {
        sqlx::query("UPDATE folders SET status = $1 WHERE id = $2")
            .bind(STATUS_DELETED)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to mark folder deleted")?;

        Ok(())
    }

    /// Remove a folder row and its images permanently.
    pub async fn purge(pool: &PgPool, id: i64) -> Result<u64> {
        let mut tx = pool.begin().await.context("failed to begin purge")?;

        let images = sqlx::query("DELETE FROM images WHERE folder_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to purge folder images")?
            .rows_affected();

        sqlx::query("DELETE FROM folders WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to purge folder")?;

        tx.commit().await.context("failed to commit purge")?;
        Ok(images)
    }

    /// Update a folder's path (rename/move).
    pub async fn set_path(pool: &PgPool, id: i64, path: &str) -> Result<()> {
        sqlx::query("UPDATE folders SET path = $1 WHERE id = $2")
            .bind(normalise_path(path))
            .bind(id)
            .execute(pool)
            .await
            .context("failed to update folder path")?;

        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
