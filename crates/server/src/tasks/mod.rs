//! Background task queue and worker pool.
//!
//! The queue is a Postgres table with (function, params) uniqueness;
//! the worker pool is a separate process (`refract tasks`) holding a
//! well-known port as a single-instance mutex.

mod functions;
mod runner;
mod service;
mod types;

pub use functions::TaskContext;
pub use runner::TaskRunner;
pub use service::TaskService;
pub use types::{Task, TaskOutcome, TaskParams, TaskPriority, TaskStatus};
