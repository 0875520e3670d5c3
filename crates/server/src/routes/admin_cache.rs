//! Cache administration routes.

use axum::{
    extract::{Extension, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::state::AppState;

/// Create the cache admin router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/admin/cache/", get(cache_stats).delete(flush_cache))
}

#[derive(Debug, Serialize)]
struct CacheStatsResponse {
    used_bytes: u64,
    capacity_bytes: u64,
    permission_cache_entries: usize,
}

/// GET /api/admin/cache/ — capacity and usage.
async fn cache_stats(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Response> {
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    if !state.permissions().has_system(Some(user)) {
        return Err(AppError::Security("administrator access required".into()));
    }

    let usage = state.cache().usage().await;
    Ok(Json(CacheStatsResponse {
        used_bytes: usage.used_bytes,
        capacity_bytes: usage.capacity_bytes,
        permission_cache_entries: state.permissions().cache_size(),
    })
    .into_response())
}

/// DELETE /api/admin/cache/ — drop every cached derivative.
async fn flush_cache(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Response> {
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    if !state.permissions().has_system(Some(user)) {
        return Err(AppError::Security("administrator access required".into()));
    }

    state
        .cache()
        .flush()
        .await
        .map_err(AppError::Internal)?;

    tracing::info!(user = %user.name, "cache flushed");
    Ok(Json(serde_json::json!({ "flushed": true })).into_response())
}
