//! HTTP route handlers.

pub mod admin_cache;
pub mod admin_files;
pub mod admin_images;
pub mod admin_permissions;
pub mod health;
pub mod image;
pub mod metrics;
pub mod tasks;
