//! Task administration routes.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::state::AppState;
use crate::tasks::{TaskParams, TaskPriority, TaskStatus};

/// Create the task admin router.
///
/// One path shape serves both verbs: POST takes a function name,
/// GET takes a task id.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/admin/tasks/{key}",
        post(submit_task).get(task_status),
    )
}

/// POST /api/admin/tasks/{function} — submit a background task. A
/// duplicate of a pending/active task answers 409 with the existing id.
async fn submit_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(function): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    if !state.permissions().has_system(Some(user)) {
        return Err(AppError::Security("administrator access required".into()));
    }

    // The function name plus the body is exactly the tagged union.
    let mut tagged = body;
    if let Some(obj) = tagged.as_object_mut() {
        obj.insert("fn".to_string(), json!(function));
    } else {
        return Err(AppError::InvalidParameter("body must be a JSON object".into()));
    }
    let params: TaskParams = serde_json::from_value(tagged)
        .map_err(|e| AppError::InvalidParameter(format!("bad task parameters: {e}")))?;

    let (task, created) = state
        .tasks()
        .submit(
            &format!("API: {function}"),
            &params,
            TaskPriority::Normal,
            600,
            Some(user.id),
        )
        .await?;

    if !created {
        return Err(AppError::AlreadyExists(format!("task {}", task.id)));
    }

    Ok((StatusCode::OK, Json(task)).into_response())
}

/// GET /api/admin/tasks/{id} — poll a task. With `wait=<secs>` the
/// handler polls up to that long; a task still running when the wait
/// expires answers 202 "accepted, still running".
async fn task_status(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(key): Path<String>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Response> {
    let id: Uuid = key
        .parse()
        .map_err(|_| AppError::InvalidParameter(format!("not a task id: '{key}'")))?;
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    if !state.permissions().has_system(Some(user)) {
        return Err(AppError::Security("administrator access required".into()));
    }

    let wait_secs = query.wait.unwrap_or(0).min(60);
    if wait_secs > 0 {
        if let Some(task) = state
            .tasks()
            .wait_for(id, std::time::Duration::from_secs(wait_secs))
            .await?
        {
            return Ok((StatusCode::OK, Json(task)).into_response());
        }
    }

    let task = state
        .tasks()
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;

    let status = if task.status() == TaskStatus::Complete {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(task)).into_response())
}

#[derive(Debug, serde::Deserialize)]
struct StatusQuery {
    wait: Option<u64>,
}
