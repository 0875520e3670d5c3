//! Application error types.
//!
//! Every error kind has exactly one canonical HTTP status. 4xx responses
//! carry a short reason; 5xx responses stay terse and the detail goes to
//! the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// A request field failed validation, an unknown template or ICC
    /// profile was named, or a tile spec was malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An API endpoint was called without credentials.
    #[error("authentication required")]
    RequiresAuth,

    /// The permission oracle denied access, or a path tried to escape
    /// the images root.
    #[error("permission denied: {0}")]
    Security(String),

    /// The source does not exist, or exists but is flagged deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key violation on create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The source bytes could not be decoded or transformed.
    #[error("image error: {0}")]
    Image(String),

    /// The stampede wait budget expired while another worker held the
    /// generation lock. Retryable.
    #[error("server too busy")]
    ServerTooBusy,

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    /// The canonical HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            AppError::RequiresAuth => StatusCode::UNAUTHORIZED,
            AppError::Security(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Image(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ServerTooBusy => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal server error");
                "internal server error".to_string()
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, body).into_response()
    }
}

/// Translate a database integrity error on create into `AlreadyExists`.
///
/// Any other database error passes through unchanged.
pub fn created_or_conflict(err: sqlx::Error, what: &str) -> AppError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            return AppError::AlreadyExists(what.to_string());
        }
    }
    AppError::Database(err)
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::InvalidParameter("width".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::RequiresAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Security("escape".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("x.jpg".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::AlreadyExists("task".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Image("bad bytes".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            AppError::ServerTooBusy.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
