//! Image delivery routes.
//!
//! `GET /image` is the pipeline entry point; `GET /original` bypasses
//! the pipeline and streams the source bytes after a permission check.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Extension, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::TimeZone;

use crate::error::{AppError, AppResult};
use crate::manager::{DeliveryOpts, ImageResponse, ServeOutcome};
use crate::middleware::CurrentUser;
use crate::spec::ImageSpec;
use crate::state::AppState;

/// Create the image delivery router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/image", get(serve_image))
        .route("/original", get(serve_original))
}

fn parse_flag(params: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match params.get(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        _ => default,
    }
}

fn http_date(ts: i64) -> Option<HeaderValue> {
    let dt = chrono::Utc.timestamp_opt(ts, 0).single()?;
    HeaderValue::from_str(&dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()).ok()
}

fn cache_control(expiry_secs: i64) -> String {
    if expiry_secs > 0 {
        format!("public, max-age={expiry_secs}")
    } else {
        "no-cache".to_string()
    }
}

/// GET /image — generate or serve one derivative.
async fn serve_image(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let spec = ImageSpec::from_params(&params)?;

    // Delivery flags ride outside the spec.
    let opts = DeliveryOpts {
        attachment: parse_flag(&params, "attach", false),
        record_stats: parse_flag(&params, "stats", true),
        use_cache: parse_flag(&params, "cache", true),
        recache: parse_flag(&params, "recache", false),
    };
    if let Some(xref) = params.get("xref") {
        tracing::debug!(xref = %xref, "external reference noted");
    }

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .manager()
        .serve(spec, user.as_ref(), if_none_match, &opts)
        .await?;

    match outcome {
        ServeOutcome::NotModified { etag, expiry_secs } => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            let headers = response.headers_mut();
            headers.insert(header::ETAG, quoted(&etag)?);
            if let Ok(v) = HeaderValue::from_str(&cache_control(expiry_secs)) {
                headers.insert(header::CACHE_CONTROL, v);
            }
            headers.insert("X-From-Cache", HeaderValue::from_static("true"));
            Ok(response)
        }
        ServeOutcome::Image(image) => image_response(*image),
    }
}

fn quoted(etag: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!("\"{etag}\""))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("bad etag header: {e}")))
}

fn image_response(image: ImageResponse) -> AppResult<Response> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &image.mime)
        .header(header::ETAG, quoted(&image.etag)?)
        .header(header::CACHE_CONTROL, cache_control(image.expiry_secs))
        .header(
            "X-From-Cache",
            if image.from_cache { "true" } else { "false" },
        );

    if image.expiry_secs > 0 {
        let expires = chrono::Utc::now().timestamp() + image.expiry_secs;
        if let Some(v) = http_date(expires) {
            response = response.header(header::EXPIRES, v);
        }
    }
    if let Some(modified) = image.last_modified {
        if let Some(v) = http_date(modified) {
            response = response.header(header::LAST_MODIFIED, v);
        }
    }

    let disposition = if image.attachment {
        format!("attachment; filename=\"{}\"", image.filename)
    } else {
        format!("inline; filename=\"{}\"", image.filename)
    };
    response = response.header(header::CONTENT_DISPOSITION, disposition);

    response
        .body(Body::from(image.bytes))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to build response: {e}")))
}

/// GET /original — stream the source bytes around the pipeline.
async fn serve_original(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let src = params
        .get("src")
        .ok_or_else(|| AppError::InvalidParameter("src: parameter is required".into()))?;

    let original = state.manager().serve_original(src, user.as_ref()).await?;

    let attachment = parse_flag(&params, "attach", false);
    let disposition = if attachment {
        format!("attachment; filename=\"{}\"", original.filename)
    } else {
        format!("inline; filename=\"{}\"", original.filename)
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &original.mime)
        .header(header::CONTENT_DISPOSITION, disposition);

    if let Some(v) = http_date(original.last_modified) {
        response = response.header(header::LAST_MODIFIED, v);
    }

    response
        .body(Body::from(original.bytes))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to build response: {e}")))
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_with_defaults() {
        let mut params = HashMap::new();
        params.insert("attach".to_string(), "1".to_string());
        params.insert("stats".to_string(), "0".to_string());
        assert!(parse_flag(&params, "attach", false));
        assert!(!parse_flag(&params, "stats", true));
        assert!(parse_flag(&params, "cache", true));
        assert!(!parse_flag(&params, "recache", false));
    }

    #[test]
    fn http_dates_render() {
        let v = http_date(0).unwrap();
        assert_eq!(v.to_str().unwrap(), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn cache_control_maps_expiry() {
        assert_eq!(cache_control(3600), "public, max-age=3600");
        assert_eq!(cache_control(0), "no-cache");
    }
}
