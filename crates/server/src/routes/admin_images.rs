//! Image detail administration: dimensions and embedded properties.

use std::collections::HashMap;

use axum::{
    extract::{Extension, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::codec::ProfileProperty;
use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::permissions::Access;
use crate::spec::ImageSpec;
use crate::state::AppState;

/// Create the image admin router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/admin/images/details", get(image_details))
}

#[derive(Debug, Serialize)]
struct ImageDetails {
    src: String,
    width: u32,
    height: u32,
    properties: Vec<ProfileProperty>,
}

/// GET /api/admin/images/details?src= — header-level facts about an
/// original: pixel dimensions and embedded EXIF properties.
async fn image_details(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let user = user.as_ref().ok_or(AppError::RequiresAuth)?;
    let src = params
        .get("src")
        .ok_or_else(|| AppError::InvalidParameter("src: parameter is required".into()))?;

    if !crate::storage::validate_path(src) {
        return Err(AppError::Security(format!(
            "path '{src}' is outside the images root"
        )));
    }
    let folder = match src.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    };
    state
        .permissions()
        .require_folder(Some(user), &folder, Access::View)
        .await?;

    let bytes = state.storage().read(src).await?;
    let hint = ImageSpec::for_source(src.clone()).src_extension();

    let (width, height) = state.manager().probe_dimensions(&bytes, &hint)?;
    let properties = state.manager().probe_profile_data(&bytes, &hint);

    Ok(Json(ImageDetails {
        src: src.clone(),
        width,
        height,
        properties,
    })
    .into_response())
}
