//! API token authentication middleware.
//!
//! Resolves `Authorization: Bearer <token>` against the users table and
//! stashes the result as a request extension. No header means the
//! public (anonymous) user; handlers that need credentials check for
//! one and answer 401 themselves.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::models::User;
use crate::state::AppState;

/// The authenticated user for this request, if any.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<User>);

/// Middleware that authenticates via Bearer token.
///
/// - Valid token -> the user rides along as an extension.
/// - Invalid token -> 401 immediately.
/// - No header -> anonymous.
pub async fn authenticate_api_token(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let user = match auth_header {
        Some(v) if v.starts_with("Bearer ") => {
            let raw_token = &v[7..];
            match User::find_by_token(state.db(), raw_token).await {
                Ok(Some(user)) => Some(user),
                Ok(None) => {
                    return (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(json!({"error": "Invalid API token"})),
                    )
                        .into_response();
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to look up API token");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        axum::Json(json!({"error": "Internal server error"})),
                    )
                        .into_response();
                }
            }
        }
        _ => None,
    };

    request.extensions_mut().insert(CurrentUser(user));
    next.run(request).await
}
