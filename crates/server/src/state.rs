//! Application state shared across all handlers.
//!
//! Every service is constructed once at startup with explicit
//! dependencies and reached through this value; there are no module
//! globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::Client as RedisClient;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::codec::{Codec, RasterCodec};
use crate::config::Config;
use crate::db;
use crate::icc::IccRegistry;
use crate::manager::ImageManager;
use crate::metrics::Metrics;
use crate::permissions::PermissionOracle;
use crate::spec::ImagingDefaults;
use crate::stats::StatsSink;
use crate::storage::ImageStorage;
use crate::tasks::{TaskContext, TaskParams, TaskPriority, TaskService};
use crate::template::TemplateRegistry;

/// Interval between housekeeping task submissions (~24 h). The queue
/// deduplicates, so overlapping web workers are harmless.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool.
    db: PgPool,

    /// Redis client backing the derivative cache.
    redis: RedisClient,

    /// Derivative cache (chunked blobs + search index + locks).
    cache: Arc<CacheManager>,

    /// Blob store of original images.
    storage: Arc<ImageStorage>,

    /// Hot-reloading template registry.
    templates: Arc<TemplateRegistry>,

    /// ICC profile registry.
    icc: Arc<IccRegistry>,

    /// Permission oracle.
    permissions: PermissionOracle,

    /// Statistics sink.
    stats: StatsSink,

    /// Task queue service.
    tasks: TaskService,

    /// The imaging back end.
    codec: Arc<dyn Codec>,

    /// The image manager (hot path).
    manager: ImageManager,

    /// Prometheus metrics.
    metrics: Arc<Metrics>,

    /// Loaded configuration.
    config: Config,
}

impl AppState {
    /// Create new application state with database connections.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = db::create_pool(config)
            .await
            .context("failed to create database pool")?;

        db::run_migrations(&db)
            .await
            .context("failed to run migrations")?;

        let redis = RedisClient::open(config.redis_url.as_str())
            .context("failed to create Redis client")?;

        let mut conn = redis
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis")?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("Redis PING failed")?;

        let cache = Arc::new(CacheManager::new(
            redis.clone(),
            db.clone(),
            config.stampede_wait_secs,
        ));

        let storage = Arc::new(ImageStorage::new(&config.images_dir));
        let templates = Arc::new(
            TemplateRegistry::load(&config.templates_dir)
                .context("failed to load templates")?,
        );
        let icc = Arc::new(
            IccRegistry::load(&config.icc_dir).context("failed to load ICC profiles")?,
        );

        let permissions = PermissionOracle::new(db.clone(), Arc::clone(&cache));
        let stats = StatsSink::start(db.clone());
        let tasks = TaskService::new(db.clone());
        let metrics = Arc::new(Metrics::new());

        let codec: Arc<dyn Codec> = Arc::new(RasterCodec::new());

        let defaults = ImagingDefaults {
            format: (!config.default_format.is_empty()).then(|| config.default_format.clone()),
            colorspace: None,
            strip: Some(config.default_strip),
            dpi: None,
        };

        let manager = ImageManager::new(
            db.clone(),
            Arc::clone(&cache),
            Arc::clone(&storage),
            Arc::clone(&codec),
            Arc::clone(&templates),
            Arc::clone(&icc),
            permissions.clone(),
            stats.clone(),
            tasks.clone(),
            Arc::clone(&metrics),
            defaults,
            config.default_quality,
            config.default_expiry_secs,
            config.pyramid_pixel_threshold,
        );

        info!(
            templates = templates.names().len(),
            icc_profiles = icc.names().len(),
            "services initialised"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                db,
                redis,
                cache,
                storage,
                templates,
                icc,
                permissions,
                stats,
                tasks,
                codec,
                manager,
                metrics,
                config: config.clone(),
            }),
        })
    }

    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub fn redis(&self) -> &RedisClient {
        &self.inner.redis
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub fn storage(&self) -> &Arc<ImageStorage> {
        &self.inner.storage
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.inner.templates
    }

    pub fn icc(&self) -> &Arc<IccRegistry> {
        &self.inner.icc
    }

    pub fn permissions(&self) -> &PermissionOracle {
        &self.inner.permissions
    }

    pub fn stats(&self) -> &StatsSink {
        &self.inner.stats
    }

    pub fn tasks(&self) -> &TaskService {
        &self.inner.tasks
    }

    pub fn manager(&self) -> &ImageManager {
        &self.inner.manager
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The context handed to task functions in the task-server process.
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            pool: self.inner.db.clone(),
            cache: Arc::clone(&self.inner.cache),
            storage: Arc::clone(&self.inner.storage),
            codec: Arc::clone(&self.inner.codec),
            manager: self.inner.manager.clone(),
            temp_dir: self.inner.config.temp_dir.clone(),
        }
    }

    /// Periodically enqueue housekeeping. Queue dedup keeps concurrent
    /// web workers from piling up duplicates.
    pub fn spawn_housekeeping(&self) {
        let tasks = self.inner.tasks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let params = TaskParams::CleanupTempFiles { max_age_hours: 24 };
                if let Err(e) = tasks
                    .submit(
                        "Delete old temporary files",
                        &params,
                        TaskPriority::Low,
                        60,
                        None,
                    )
                    .await
                {
                    warn!(error = %e, "failed to enqueue housekeeping task");
                }
            }
        });
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}
