//! Task function implementations.
//!
//! Each `TaskParams` variant dispatches to one function here. Failures
//! come back as a typed outcome; nothing panics across the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::codec::{caps, Codec};
use crate::error::AppError;
use crate::manager::ImageManager;
use crate::models::{Folder, ImageRecord};
use crate::storage::{normalise_path, ImageStorage};

use super::types::{TaskOutcome, TaskParams};

/// Everything a task function may need, threaded through the runner.
#[derive(Clone)]
pub struct TaskContext {
    pub pool: PgPool,
    pub cache: Arc<CacheManager>,
    pub storage: Arc<ImageStorage>,
    pub codec: Arc<dyn Codec>,
    pub manager: ImageManager,
    pub temp_dir: PathBuf,
}

/// Run one task function to its outcome.
pub async fn run(ctx: &TaskContext, params: &TaskParams) -> TaskOutcome {
    match params {
        TaskParams::BuildPyramid { image_id, format } => {
            build_pyramid(ctx, *image_id, format).await
        }
        TaskParams::BurstPdf { src, dpi } => burst_pdf(ctx, src, *dpi).await,
        TaskParams::MoveFolder {
            folder_id,
            target_path,
        } => move_folder(ctx, *folder_id, target_path).await,
        TaskParams::PurgeFolderData { folder_id } => purge_folder_data(ctx, *folder_id).await,
        TaskParams::CleanupTempFiles { max_age_hours } => {
            cleanup_temp_files(ctx, *max_age_hours).await
        }
    }
}

fn failure(err: &AppError) -> TaskOutcome {
    let kind = match err {
        AppError::NotFound(_) => "NotFound",
        AppError::Image(_) => "ImageError",
        AppError::Security(_) => "SecurityError",
        AppError::InvalidParameter(_) => "InvalidParameter",
        _ => "Internal",
    };
    TaskOutcome::failed(kind, err.to_string())
}

async fn build_pyramid(ctx: &TaskContext, image_id: i64, format: &str) -> TaskOutcome {
    match ctx.manager.build_pyramid(image_id, format).await {
        Ok(levels) => TaskOutcome::completed(json!({ "levels": levels })),
        Err(e) => failure(&e),
    }
}

async fn burst_pdf(ctx: &TaskContext, src: &str, dpi: u32) -> TaskOutcome {
    // Capability discovery already disabled the feature at startup; a
    // queued task from before the downgrade still fails cleanly.
    if !ctx.codec.supported_operations().contains(caps::PDF) {
        return TaskOutcome::failed("Unsupported", "PDF bursting is not available");
    }

    let bytes = match ctx.storage.read(src).await {
        Ok(b) => b,
        Err(e) => return failure(&e),
    };

    let dest = ctx.temp_dir.join("pdf_burst").join(src.replace('/', "_"));
    if let Err(e) = tokio::fs::create_dir_all(&dest).await {
        return TaskOutcome::failed("Internal", e.to_string());
    }

    match ctx.codec.burst_pdf(&bytes, &dest, dpi) {
        Ok(done) => TaskOutcome::completed(json!({ "complete": done })),
        Err(e) => TaskOutcome::failed("ImageError", e.to_string()),
    }
}

/// Move a folder: database paths for the folder, its subtree and its
/// images, the physical directory, and every cached derivative under it.
async fn move_folder(ctx: &TaskContext, folder_id: i64, target_path: &str) -> TaskOutcome {
    let target = normalise_path(target_path);

    let folder = match Folder::find_by_id(&ctx.pool, folder_id).await {
        Ok(Some(f)) => f,
        Ok(None) => return TaskOutcome::failed("NotFound", format!("folder {folder_id}")),
        Err(e) => return TaskOutcome::failed("Internal", e.to_string()),
    };
    let old_path = folder.path.clone();
    if old_path.is_empty() {
        return TaskOutcome::failed("InvalidParameter", "cannot move the root folder");
    }

    // Ensure the new parent chain exists in the database before any row
    // starts pointing into it.
    let parent_path = match target.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    };
    let parent = match Folder::ensure_chain(&ctx.pool, &parent_path).await {
        Ok(p) => p,
        Err(e) => return TaskOutcome::failed("Internal", e.to_string()),
    };

    if let Err(e) = ctx.storage.rename(&old_path, &target).await {
        return failure(&e);
    }

    // Re-point the folder, then rewrite the subtree paths and image srcs.
    let result: anyhow::Result<u64> = async {
        sqlx::query("UPDATE folders SET path = $1, parent_id = $2 WHERE id = $3")
            .bind(&target)
            .bind(parent.id)
            .bind(folder_id)
            .execute(&ctx.pool)
            .await?;

        let prefix = format!("{old_path}/");
        sqlx::query(
            "UPDATE folders SET path = $1 || substr(path, $2) WHERE path LIKE $3",
        )
        .bind(format!("{target}/"))
        .bind(prefix.len() as i32 + 1)
        .bind(format!("{}%", like_escape(&prefix)))
        .execute(&ctx.pool)
        .await?;

        let moved = sqlx::query(
            "UPDATE images SET src = $1 || substr(src, $2) WHERE src LIKE $3",
        )
        .bind(format!("{target}/"))
        .bind(prefix.len() as i32 + 1)
        .bind(format!("{}%", like_escape(&prefix)))
        .execute(&ctx.pool)
        .await?
        .rows_affected();

        Ok(moved)
    }
    .await;

    let moved = match result {
        Ok(n) => n,
        Err(e) => return TaskOutcome::failed("Internal", e.to_string()),
    };

    // Cached derivatives key on source ids whose paths just changed.
    invalidate_folder_images(ctx, folder_id).await;

    info!(folder_id, from = %old_path, to = %target, images = moved, "folder moved");
    TaskOutcome::completed(json!({ "images_moved": moved, "path": target }))
}

/// Permanently remove a deleted folder's rows and cached derivatives.
async fn purge_folder_data(ctx: &TaskContext, folder_id: i64) -> TaskOutcome {
    invalidate_folder_images(ctx, folder_id).await;

    match Folder::purge(&ctx.pool, folder_id).await {
        Ok(images) => {
            info!(folder_id, images, "folder data purged");
            TaskOutcome::completed(json!({ "images_purged": images }))
        }
        Err(e) => TaskOutcome::failed("Internal", e.to_string()),
    }
}

async fn invalidate_folder_images(ctx: &TaskContext, folder_id: i64) {
    match ImageRecord::in_folder(&ctx.pool, folder_id).await {
        Ok(images) => {
            for image in images {
                ctx.manager.invalidate_source(&image.src, image.id).await;
            }
        }
        Err(e) => warn!(error = %e, folder_id, "failed to list folder images"),
    }
}

/// Delete temp files older than the age limit.
async fn cleanup_temp_files(ctx: &TaskContext, max_age_hours: u32) -> TaskOutcome {
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(max_age_hours) * 3600);
    let mut deleted = 0u64;

    let mut stack = vec![ctx.temp_dir.join("pdf_burst")];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified < cutoff && tokio::fs::remove_file(&path).await.is_ok() {
                deleted += 1;
            }
        }
    }

    info!(deleted, "temp files cleaned up");
    TaskOutcome::completed(json!({ "deleted": deleted }))
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn like_escaping() {
        assert_eq!(like_escape("a_b%c"), "a\\_b\\%c");
        assert_eq!(like_escape("plain/path/"), "plain/path/");
    }

    #[test]
    fn failure_kinds_map_from_errors() {
        let outcome = failure(&AppError::NotFound("x".into()));
        match outcome {
            TaskOutcome::Failed { kind, .. } => assert_eq!(kind, "NotFound"),
            _ => panic!("expected failure"),
        }
    }
}
