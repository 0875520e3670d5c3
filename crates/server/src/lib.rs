//! Refract image server library.
//!
//! This library exposes server internals for integration testing. The
//! entry point for running the server is the `refract` binary.

pub mod cache;
pub mod codec;
pub mod colour;
pub mod config;
pub mod db;
pub mod error;
pub mod icc;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod permissions;
pub mod routes;
pub mod spec;
pub mod state;
pub mod stats;
pub mod storage;
pub mod tasks;
pub mod template;

// Re-export key types for testing
pub use config::Config;
pub use error::{AppError, AppResult};
pub use manager::{DeliveryOpts, ImageManager, ServeOutcome};
pub use spec::ImageSpec;
pub use state::AppState;
