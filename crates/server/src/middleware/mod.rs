//! HTTP middleware.

mod bearer;
mod request_metrics;

pub use bearer::{authenticate_api_token, CurrentUser};
pub use request_metrics::track_requests;
