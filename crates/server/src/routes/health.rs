//! Health probe.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::db;
use crate::state::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(health))
}

/// GET /healthz — database and cache probes.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = db::check_health(state.db()).await;

    let redis_ok = match state.redis().get_multiplexed_async_connection().await {
        Ok(mut conn) => redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok(),
        Err(_) => false,
    };

    let status = if db_ok && redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok && redis_ok { "ok" } else { "degraded" },
            "database": db_ok,
            "cache": redis_ok,
        })),
    )
}
