//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Redis connection URL.
    pub redis_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Root directory holding the original images.
    pub images_dir: PathBuf,

    /// Directory holding image template files (*.toml).
    pub templates_dir: PathBuf,

    /// Directory holding ICC colour profiles (*.icc, *.icm).
    pub icc_dir: PathBuf,

    /// Directory for temporary files (PDF bursts, uploads in flight).
    pub temp_dir: PathBuf,

    /// Default output format when a request names none (default: jpg).
    pub default_format: String,

    /// Strip metadata from derivatives by default.
    pub default_strip: bool,

    /// Encoding quality the imaging engine uses when an operation runs
    /// and the request names none (default: 80).
    pub default_quality: u8,

    /// Client cache lifetime in seconds for responses with no template
    /// override (default: 7 days).
    pub default_expiry_secs: i64,

    /// Seconds a request waits on another worker's generation lock
    /// before giving up. Clamped to [10, 120] at use.
    pub stampede_wait_secs: u64,

    /// Originals above this pixel count are eligible for background
    /// pyramid builds (default: 1,000,000).
    pub pyramid_pixel_threshold: u64,

    /// Number of workers in the task-server pool (default: 4).
    pub task_workers: usize,

    /// Port the task-server binds as its single-instance mutex.
    pub task_server_port: u16,

    /// Seconds completed tasks are kept before purging (default: 600).
    pub task_keep_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let images_dir = env::var("IMAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./images"));

        let templates_dir = env::var("TEMPLATES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./templates"));

        let icc_dir = env::var("ICC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./icc"));

        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        let default_format = env::var("DEFAULT_FORMAT")
            .unwrap_or_else(|_| "jpg".to_string())
            .to_lowercase();

        let default_strip = env::var("DEFAULT_STRIP")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let default_quality = env::var("DEFAULT_QUALITY")
            .unwrap_or_else(|_| "80".to_string())
            .parse()
            .context("DEFAULT_QUALITY must be 1..=100")?;

        let default_expiry_secs = env::var("DEFAULT_EXPIRY_SECS")
            .unwrap_or_else(|_| "604800".to_string())
            .parse()
            .context("DEFAULT_EXPIRY_SECS must be a valid i64")?;

        let stampede_wait_secs = env::var("STAMPEDE_WAIT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("STAMPEDE_WAIT_SECS must be a valid u64")?;

        let pyramid_pixel_threshold = env::var("PYRAMID_PIXEL_THRESHOLD")
            .unwrap_or_else(|_| "1000000".to_string())
            .parse()
            .context("PYRAMID_PIXEL_THRESHOLD must be a valid u64")?;

        let task_workers = env::var("TASK_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .context("TASK_WORKERS must be a valid usize")?;

        let task_server_port = env::var("TASK_SERVER_PORT")
            .unwrap_or_else(|_| "9375".to_string())
            .parse()
            .context("TASK_SERVER_PORT must be a valid u16")?;

        let task_keep_secs = env::var("TASK_KEEP_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .context("TASK_KEEP_SECS must be a valid i64")?;

        Ok(Self {
            port,
            database_url,
            redis_url,
            database_max_connections,
            images_dir,
            templates_dir,
            icc_dir,
            temp_dir,
            default_format,
            default_strip,
            default_quality,
            default_expiry_secs,
            stampede_wait_secs,
            pyramid_pixel_threshold,
            task_workers,
            task_server_port,
            task_keep_secs,
        })
    }
}
