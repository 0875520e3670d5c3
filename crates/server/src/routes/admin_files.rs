//! Filesystem administration routes: folder create and delete.

use axum::{
    extract::{Extension, Form, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{created_or_conflict, AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{Folder, User};
use crate::permissions::Access;
use crate::state::AppState;
use crate::storage::{normalise_path, validate_path};
use crate::tasks::{TaskParams, TaskPriority};

/// Create the filesystem admin router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/admin/filesystem/folders/", post(create_folder))
        .route("/api/admin/filesystem/folders/{id}", delete(delete_folder))
}

fn require_user(user: &Option<User>) -> AppResult<&User> {
    user.as_ref().ok_or(AppError::RequiresAuth)
}

#[derive(Debug, Deserialize)]
struct CreateFolderRequest {
    path: String,
}

#[derive(Debug, Serialize)]
struct FolderResponse {
    id: i64,
    /// Normalised path with a leading separator, no duplicates.
    path: String,
}

/// POST /api/admin/filesystem/folders/ — create a folder (and its
/// physical directory), normalising the supplied path.
async fn create_folder(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Form(request): Form<CreateFolderRequest>,
) -> AppResult<Response> {
    let user = require_user(&user)?;

    let path = normalise_path(&request.path);
    if path.is_empty() || !validate_path(&path) {
        return Err(AppError::InvalidParameter(format!(
            "path: invalid folder path '{}'",
            request.path
        )));
    }

    let parent_path = match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    };
    state
        .permissions()
        .has_folder(Some(user), &parent_path, Access::CreateFolder, true)
        .await?
        .then_some(())
        .ok_or_else(|| AppError::Security(format!("no create access in '{parent_path}'")))?;

    if Folder::find_by_path(state.db(), &path).await?.is_some() {
        return Err(AppError::AlreadyExists(format!("folder '{path}'")));
    }

    // Parents first, then the leaf; a lost race maps to 409.
    let parent = Folder::ensure_chain(state.db(), &parent_path).await?;
    let folder = Folder::create(state.db(), &path, parent.id)
        .await
        .map_err(|e| created_or_conflict(e, &format!("folder '{path}'")))?;

    state.storage().mkdir(&path).await?;

    Ok(Json(FolderResponse {
        id: folder.id,
        path: format!("/{}", folder.path),
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct DeleteFolderResponse {
    id: i64,
    task_id: uuid::Uuid,
}

/// DELETE /api/admin/filesystem/folders/{id} — flag the folder deleted
/// and enqueue the purge of its data.
async fn delete_folder(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let user = require_user(&user)?;

    let folder = Folder::find_by_id(state.db(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("folder {id}")))?;
    if folder.path.is_empty() {
        return Err(AppError::InvalidParameter("cannot delete the root folder".into()));
    }

    state
        .permissions()
        .require_folder(Some(user), &folder.path, Access::DeleteFolder)
        .await?;

    Folder::mark_deleted(state.db(), id).await?;

    let params = TaskParams::PurgeFolderData { folder_id: id };
    let (task, created) = state
        .tasks()
        .submit(
            &format!("Purge deleted folder {}", folder.path),
            &params,
            TaskPriority::Normal,
            600,
            Some(user.id),
        )
        .await?;

    if !created {
        return Err(AppError::AlreadyExists(format!(
            "purge of folder {id} (task {})",
            task.id
        )));
    }

    Ok((
        StatusCode::OK,
        Json(DeleteFolderResponse {
            id,
            task_id: task.id,
        }),
    )
        .into_response())
}
