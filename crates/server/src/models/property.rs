//! String property bag, including the permission version counter.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Key of the folder-permission version counter.
pub const PERMISSIONS_VERSION: &str = "permissions_version";

/// Read a property value.
pub async fn get(pool: &PgPool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM properties WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch property")?;

    Ok(row.map(|(v,)| v))
}

/// Write a property value.
pub async fn set(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO properties (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("failed to set property")?;

    Ok(())
}

/// Atomically increment an integer-valued property and return the new
/// value. Missing or non-numeric values restart the counter at 1.
pub async fn increment(pool: &PgPool, key: &str) -> Result<i64> {
    let row: (String,) = sqlx::query_as(
        r#"
        INSERT INTO properties (key, value)
        VALUES ($1, '1')
        ON CONFLICT (key) DO UPDATE
            SET value = (COALESCE(NULLIF(properties.value, '')::bigint, 0) + 1)::text
        RETURNING value
        "#,
    )
    .bind(key)
    .fetch_one(pool)
    .await
    .context("failed to increment property")?;

    Ok(row.0.parse().unwrap_or(1))
}

/// Read an integer-valued property, defaulting to 1.
pub async fn get_version(pool: &PgPool, key: &str) -> Result<i64> {
    Ok(get(pool, key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(1))
}
