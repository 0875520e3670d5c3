//! Searchable cache index.
//!
//! A small relational table parallels the blob store: key, value size,
//! five indexed integer search fields and an optional metadata blob. It
//! is what makes "find me a candidate base image" a single range query.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// One row of the control table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IndexEntry {
    pub key: String,
    pub valuesize: i64,
    pub f1: i64,
    pub f2: i64,
    pub f3: i64,
    pub f4: i64,
    pub f5: i64,
    pub extra: Option<serde_json::Value>,
}

/// Ceiling on candidates returned by a base search.
pub const SEARCH_LIMIT: i64 = 100;

/// Postgres-backed cache control table.
pub struct CacheIndex {
    pool: PgPool,
}

impl CacheIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace an index row.
    pub async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cachectl (key, valuesize, f1, f2, f3, f4, f5, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (key) DO UPDATE SET
                valuesize = EXCLUDED.valuesize,
                f1 = EXCLUDED.f1,
                f2 = EXCLUDED.f2,
                f3 = EXCLUDED.f3,
                f4 = EXCLUDED.f4,
                f5 = EXCLUDED.f5,
                extra = EXCLUDED.extra
            "#,
        )
        .bind(&entry.key)
        .bind(entry.valuesize)
        .bind(entry.f1)
        .bind(entry.f2)
        .bind(entry.f3)
        .bind(entry.f4)
        .bind(entry.f5)
        .bind(&entry.extra)
        .execute(&self.pool)
        .await
        .context("failed to upsert cache index row")?;
        Ok(())
    }

    /// Remove one index row.
    pub async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cachectl WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to delete cache index row")?;
        Ok(())
    }

    /// Look up one row by key.
    pub async fn get(&self, key: &str) -> Result<Option<IndexEntry>> {
        let row = sqlx::query_as::<_, IndexEntry>("SELECT * FROM cachectl WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch cache index row")?;
        Ok(row)
    }

    /// Find candidate base images: same source, same attribute group,
    /// at least the requested dimensions, smallest first so the
    /// tightest candidate wins.
    pub async fn search_base(
        &self,
        source_id: i64,
        group_hash: i64,
        min_width: i64,
        min_height: i64,
    ) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query_as::<_, IndexEntry>(
            r#"
            SELECT * FROM cachectl
            WHERE f1 = $1 AND f2 = $2 AND f3 >= $3 AND f4 >= $4
            ORDER BY valuesize ASC
            LIMIT $5
            "#,
        )
        .bind(source_id)
        .bind(group_hash)
        .bind(min_width)
        .bind(min_height)
        .bind(SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("failed to search cache index")?;
        Ok(rows)
    }

    /// Every cached derivative of one source.
    pub async fn search_source(&self, source_id: i64) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query_as::<_, IndexEntry>("SELECT * FROM cachectl WHERE f1 = $1")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to search cache index by source")?;
        Ok(rows)
    }

    /// Drop every row (cache flush).
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE cachectl")
            .execute(&self.pool)
            .await
            .context("failed to clear cache index")?;
        Ok(())
    }
}

impl std::fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheIndex").finish()
    }
}
