//! Folder permission administration.
//!
//! Every mutation bumps the global permission version so cached
//! entries in all processes fall stale together.

use axum::{
    extract::{Extension, State},
    response::{IntoResponse, Response},
    routing::put,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{Folder, FolderPermission};
use crate::permissions::Access;
use crate::state::AppState;

/// Create the permission admin router.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/admin/permissions/",
        put(set_permission).delete(remove_permission),
    )
}

#[derive(Debug, Deserialize)]
struct PermissionRequest {
    folder_id: i64,
    group_id: Uuid,
    #[serde(default)]
    access: i16,
}

async fn require_admin(state: &AppState, user: &Option<crate::models::User>) -> AppResult<()> {
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    if !state.permissions().has_system(Some(user)) {
        return Err(AppError::Security("administrator access required".into()));
    }
    Ok(())
}

/// PUT /api/admin/permissions/ — grant a group an access level on a folder.
async fn set_permission(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(request): Json<PermissionRequest>,
) -> AppResult<Response> {
    require_admin(&state, &user).await?;

    let folder = Folder::find_by_id(state.db(), request.folder_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("folder {}", request.folder_id)))?;

    let access = Access::from_i16(request.access);
    FolderPermission::set(state.db(), folder.id, request.group_id, access.as_i16()).await?;
    state.permissions().bump_version().await?;

    Ok(Json(serde_json::json!({
        "folder_id": folder.id,
        "group_id": request.group_id,
        "access": access.as_i16(),
    }))
    .into_response())
}

/// DELETE /api/admin/permissions/ — remove a group's access record.
async fn remove_permission(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(request): Json<PermissionRequest>,
) -> AppResult<Response> {
    require_admin(&state, &user).await?;

    FolderPermission::remove(state.db(), request.folder_id, request.group_id).await?;
    state.permissions().bump_version().await?;

    Ok(Json(serde_json::json!({ "removed": true })).into_response())
}
