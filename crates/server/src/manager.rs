//! Image manager — the hot path.
//!
//! Turns one finalised request into bytes: resolve the source id, check
//! permissions, probe the cache, take the generation lock, find a
//! reusable base image, hand the operation delta to the codec, store
//! and return. Also owns the auto-pyramid optimisation and the
//! capability-driven feature downgrades decided at startup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, WaitResult, UNSET_DIM_INDEX};
use crate::codec::{caps, delta_ops, Codec, CodecError, DeltaResources};
use crate::error::{AppError, AppResult};
use crate::icc::IccRegistry;
use crate::metrics::Metrics;
use crate::models::{Folder, ImageRecord, User};
use crate::permissions::{Access, PermissionOracle};
use crate::spec::{
    attr_group_hash, mime_for, suitable_for, ImageSpec, ImagingDefaults,
};
use crate::stats::StatsSink;
use crate::storage::{validate_path, ImageStorage, Require};
use crate::tasks::{TaskParams, TaskPriority, TaskService};
use crate::template::TemplateRegistry;

/// Maximum concurrent codec invocations per process.
const ADJUST_PERMITS: usize = 4;

/// Delivery flags that travel with a request but are not part of the
/// derivative's identity.
#[derive(Debug, Clone)]
pub struct DeliveryOpts {
    /// Serve with a download disposition.
    pub attachment: bool,
    /// Record statistics (the template may also opt out).
    pub record_stats: bool,
    /// Probe and populate the cache.
    pub use_cache: bool,
    /// Drop any cached copy and regenerate.
    pub recache: bool,
}

impl Default for DeliveryOpts {
    fn default() -> Self {
        DeliveryOpts {
            attachment: false,
            record_stats: true,
            use_cache: true,
            recache: false,
        }
    }
}

/// A generated (or cache-served) derivative plus its delivery headers.
#[derive(Debug)]
pub struct ImageResponse {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub filename: String,
    pub attachment: bool,
    pub expiry_secs: i64,
    pub etag: String,
    pub last_modified: Option<i64>,
    pub from_cache: bool,
}

/// An original streamed around the pipeline.
#[derive(Debug)]
pub struct OriginalResponse {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub filename: String,
    pub last_modified: i64,
}

/// Outcome of one image request.
#[derive(Debug)]
pub enum ServeOutcome {
    /// The client's ETag still matches; no bytes were read or generated.
    NotModified { etag: String, expiry_secs: i64 },
    Image(Box<ImageResponse>),
}

/// A finalised spec plus the delivery values its template contributed.
struct Finalised {
    spec: ImageSpec,
    expiry_secs: i64,
    attachment: bool,
    record_stats: bool,
}

struct ManagerInner {
    pool: PgPool,
    cache: Arc<CacheManager>,
    storage: Arc<ImageStorage>,
    codec: Arc<dyn Codec>,
    templates: Arc<TemplateRegistry>,
    icc: Arc<IccRegistry>,
    permissions: PermissionOracle,
    stats: StatsSink,
    tasks: TaskService,
    metrics: Arc<Metrics>,
    defaults: ImagingDefaults,
    default_quality: u8,
    default_expiry_secs: i64,
    pyramid_pixel_threshold: u64,
    /// Cached (source path -> source id) mappings.
    src_ids: moka::sync::Cache<String, i64>,
    adjust_permits: Arc<Semaphore>,
    capabilities: HashSet<&'static str>,
    file_types: HashSet<&'static str>,
}

/// The image manager.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

#[allow(clippy::too_many_arguments)]
impl ImageManager {
    pub fn new(
        pool: PgPool,
        cache: Arc<CacheManager>,
        storage: Arc<ImageStorage>,
        codec: Arc<dyn Codec>,
        templates: Arc<TemplateRegistry>,
        icc: Arc<IccRegistry>,
        permissions: PermissionOracle,
        stats: StatsSink,
        tasks: TaskService,
        metrics: Arc<Metrics>,
        defaults: ImagingDefaults,
        default_quality: u8,
        default_expiry_secs: i64,
        pyramid_pixel_threshold: u64,
    ) -> Self {
        // Capability discovery: features the codec cannot supply are
        // disabled up front rather than failing mid-request.
        let capabilities = codec.supported_operations();
        let file_types = codec.supported_file_types();
        if !capabilities.contains(caps::PDF) {
            info!("PDF bursting disabled: codec does not support it");
        }
        if !capabilities.contains(caps::ROTATION_ANY) {
            info!("arbitrary-angle rotation disabled: codec supports right angles only");
        }

        Self {
            inner: Arc::new(ManagerInner {
                pool,
                cache,
                storage,
                codec,
                templates,
                icc,
                permissions,
                stats,
                tasks,
                metrics,
                defaults,
                default_quality,
                default_expiry_secs,
                pyramid_pixel_threshold,
                src_ids: moka::sync::Cache::new(10_000),
                adjust_permits: Arc::new(Semaphore::new(ADJUST_PERMITS)),
                capabilities,
                file_types,
            }),
        }
    }

    /// Operation keys the active codec supports.
    pub fn capabilities(&self) -> &HashSet<&'static str> {
        &self.inner.capabilities
    }

    /// Serve one derivative request.
    pub async fn serve(
        &self,
        spec: ImageSpec,
        user: Option<&User>,
        if_none_match: Option<&str>,
        opts: &DeliveryOpts,
    ) -> AppResult<ServeOutcome> {
        let started = Instant::now();

        // Finalise: validate, template, defaults, normalise. No I/O.
        let fin = self.finalise(spec)?;
        let mut spec = fin.spec;
        let record_stats = fin.record_stats && opts.record_stats;
        let attachment = fin.attachment || opts.attachment;

        // Resolve the source id, creating the record on first sight.
        let (source_id, folder_path) = self.resolve_source(&spec.source).await?;
        spec.source_id = source_id;

        // Permission check; the overlay folder needs view access too.
        self.inner
            .permissions
            .require_folder(user, &folder_path, Access::View)
            .await?;
        if let Some(overlay) = spec.overlay_src.clone() {
            if !validate_path(&overlay) {
                return Err(AppError::Security(format!(
                    "overlay path '{overlay}' is outside the images root"
                )));
            }
            self.inner
                .permissions
                .require_folder(user, &folder_of(&overlay), Access::View)
                .await?;
        }

        let fingerprint = spec.fingerprint()?;

        // Conditional GET from the metadata record alone.
        if let Some(client_etag) = if_none_match {
            if let Some(meta) = self.inner.cache.get_meta(&fingerprint).await {
                let etag = etag_for(&fingerprint, meta.modified);
                if client_etag.trim().trim_matches('"') == etag {
                    if record_stats {
                        self.inner
                            .stats
                            .log_request(source_id, started.elapsed().as_secs_f64());
                    }
                    return Ok(ServeOutcome::NotModified {
                        etag,
                        expiry_secs: fin.expiry_secs,
                    });
                }
            }
        }

        if opts.recache {
            self.inner.cache.invalidate_fingerprint(&fingerprint).await;
        }

        // Exact cache probe.
        let (bytes, from_cache) = if opts.use_cache && !opts.recache {
            match self.inner.cache.get_image(&fingerprint).await {
                Some(bytes) => {
                    if let Some(msg) = CacheManager::as_error(&bytes) {
                        return Err(AppError::Image(msg));
                    }
                    self.inner.metrics.cache_hits.inc();
                    (bytes, true)
                }
                None => {
                    self.inner.metrics.cache_misses.inc();
                    self.generate_with_lock(&spec, &fingerprint, opts).await?
                }
            }
        } else {
            self.inner.metrics.cache_misses.inc();
            self.generate_with_lock(&spec, &fingerprint, opts).await?
        };

        // Fire statistics unless the template opted out.
        let elapsed = started.elapsed().as_secs_f64();
        if record_stats {
            self.inner.stats.log_request(source_id, elapsed);
            if attachment {
                self.inner
                    .stats
                    .log_download(source_id, bytes.len() as u64, elapsed);
            } else {
                self.inner
                    .stats
                    .log_view(source_id, bytes.len() as u64, from_cache, elapsed);
            }
        }

        let modified = self
            .inner
            .cache
            .get_meta(&fingerprint)
            .await
            .map(|m| m.modified)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let format = spec.output_format();
        Ok(ServeOutcome::Image(Box::new(ImageResponse {
            mime: mime_for(&format).to_string(),
            filename: filename_for(&spec.source, &format),
            attachment,
            expiry_secs: fin.expiry_secs,
            etag: etag_for(&fingerprint, modified),
            last_modified: Some(modified),
            from_cache,
            bytes,
        })))
    }

    /// Stream an original, bypassing the pipeline, after a permission
    /// check. Download access is required.
    pub async fn serve_original(
        &self,
        src: &str,
        user: Option<&User>,
    ) -> AppResult<OriginalResponse> {
        let started = Instant::now();
        let (source_id, folder_path) = self.resolve_source(src).await?;

        self.inner
            .permissions
            .require_folder(user, &folder_path, Access::Download)
            .await?;

        let bytes = match self.inner.storage.read(src).await {
            Ok(bytes) => bytes,
            Err(AppError::NotFound(p)) => {
                self.heal_missing(src, source_id).await;
                return Err(AppError::NotFound(p));
            }
            Err(e) => return Err(e),
        };

        let stat = self.inner.storage.stat(src).await?;
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| {
                mime_for(&ImageSpec::for_source(src).src_extension()).to_string()
            });

        self.inner
            .stats
            .log_download(source_id, bytes.len() as u64, started.elapsed().as_secs_f64());

        Ok(OriginalResponse {
            mime,
            filename: src.rsplit('/').next().unwrap_or(src).to_string(),
            last_modified: stat.modified.timestamp(),
            bytes,
        })
    }

    /// Pixel dimensions of raw bytes, via the codec.
    pub fn probe_dimensions(&self, bytes: &[u8], hint: &str) -> AppResult<(u32, u32)> {
        self.inner
            .codec
            .dimensions(bytes, hint)
            .map_err(|e| AppError::Image(e.to_string()))
    }

    /// Embedded properties (EXIF and friends) of raw bytes.
    pub fn probe_profile_data(&self, bytes: &[u8], hint: &str) -> Vec<crate::codec::ProfileProperty> {
        self.inner
            .codec
            .profile_data(bytes, hint)
            .unwrap_or_default()
    }

    /// Drop every cached trace of a source: derivatives, metadata,
    /// markers and the cached path mapping.
    pub async fn invalidate_source(&self, src: &str, source_id: i64) {
        self.inner.src_ids.invalidate(src);
        self.inner.cache.invalidate_source(source_id).await;
    }

    // ---- finalisation --------------------------------------------------

    fn finalise(&self, mut spec: ImageSpec) -> AppResult<Finalised> {
        spec.validate()?;

        // Unknown template names fail before any I/O.
        let mut expiry_secs = self.inner.default_expiry_secs;
        let mut attachment = false;
        let mut record_stats = true;
        if let Some(name) = spec.template.clone() {
            let template = self
                .inner
                .templates
                .get(&name)
                .ok_or_else(|| AppError::InvalidParameter(format!("tmp: unknown template '{name}'")))?;
            spec.apply_template(&template.spec, false);
            if let Some(secs) = template.expiry_secs {
                expiry_secs = secs;
            }
            attachment = template.attachment;
            record_stats = template.record_stats;
        }

        spec.apply_defaults(&self.inner.defaults);
        spec.normalise();
        spec.validate()?;

        // Unknown ICC profiles fail validation too.
        if let Some(ref profile) = spec.icc_profile {
            if !self.inner.icc.contains(profile) {
                return Err(AppError::InvalidParameter(format!(
                    "icc: unknown profile '{profile}'"
                )));
            }
        }

        self.check_capabilities(&spec)?;

        Ok(Finalised {
            spec,
            expiry_secs,
            attachment,
            record_stats,
        })
    }

    /// Reject request features the active codec cannot supply.
    fn check_capabilities(&self, spec: &ImageSpec) -> AppResult<()> {
        let caps_set = &self.inner.capabilities;
        let need = |key: &'static str, wanted: bool| -> AppResult<()> {
            if wanted && !caps_set.contains(key) {
                return Err(AppError::InvalidParameter(format!(
                    "{key}: not supported by this server"
                )));
            }
            Ok(())
        };

        need("page", spec.page.is_some())?;
        if let Some(r) = spec.rotation {
            if r.rem_euclid(90.0) == 0.0 {
                need(caps::ROTATION, true)?;
            } else {
                need(caps::ROTATION_ANY, true)?;
            }
        }
        need("flip", spec.flip.is_some())?;
        need("crop", spec.crop.is_some())?;
        need("fill", spec.fill.is_some())?;
        need("sharpen", spec.sharpen.is_some())?;
        need("overlay_src", spec.overlay_src.is_some())?;
        need("icc_profile", spec.icc_profile.is_some())?;
        need("tile", spec.tile.is_some())?;
        match spec.colorspace {
            Some(crate::spec::Colorspace::Cmyk) => need("cmyk", true)?,
            Some(_) => need("colorspace", true)?,
            None => {}
        }

        let ext = spec.src_extension();
        if !ext.is_empty() && !self.inner.file_types.contains(ext.as_str()) {
            return Err(AppError::Image(format!(
                "file type '{ext}' is not supported"
            )));
        }
        Ok(())
    }

    // ---- source resolution ---------------------------------------------

    /// Resolve (and on first sight create) the source id for a path.
    async fn resolve_source(&self, src: &str) -> AppResult<(i64, String)> {
        if !validate_path(src) {
            return Err(AppError::Security(format!(
                "path '{src}' is outside the images root"
            )));
        }
        let folder_path = folder_of(src);

        if let Some(id) = self.inner.src_ids.get(src) {
            return Ok((id, folder_path));
        }

        if !self
            .inner
            .storage
            .path_exists(src, Require::File)
            .await?
        {
            // The file is gone; if we once knew it, heal the mapping.
            if let Some(record) = ImageRecord::find_by_src(&self.inner.pool, src).await? {
                self.heal_missing(src, record.id).await;
            }
            return Err(AppError::NotFound(src.to_string()));
        }

        let folder = Folder::ensure_chain(&self.inner.pool, &folder_path).await?;
        let record = ImageRecord::get_or_create(&self.inner.pool, src, folder.id).await?;
        if record.is_deleted() {
            // The file is back on disk: revive the record.
            ImageRecord::reactivate(&self.inner.pool, record.id).await?;
        }

        self.inner.src_ids.insert(src.to_string(), record.id);
        Ok((record.id, folder_path))
    }

    /// Opportunistic cleanup after a NotFound: forget the source id and
    /// evict every cached derivative, then flag the record.
    async fn heal_missing(&self, src: &str, source_id: i64) {
        debug!(src = %src, source_id, "healing mapping for missing source");
        self.invalidate_source(src, source_id).await;
        if let Err(e) = ImageRecord::mark_deleted(&self.inner.pool, source_id).await {
            warn!(error = %e, src = %src, "failed to flag missing image");
        }
    }

    // ---- generation ----------------------------------------------------

    /// Acquire the stampede lock (or wait on its holder) and generate.
    /// Returns the bytes and whether they came from another worker's
    /// cache write.
    async fn generate_with_lock(
        &self,
        spec: &ImageSpec,
        fingerprint: &str,
        opts: &DeliveryOpts,
    ) -> AppResult<(Vec<u8>, bool)> {
        if !self.inner.cache.acquire_generation_lock(fingerprint).await {
            match self.inner.cache.wait_for_image(fingerprint).await {
                WaitResult::Ready(bytes) => {
                    if let Some(msg) = CacheManager::as_error(&bytes) {
                        return Err(AppError::Image(msg));
                    }
                    return Ok((bytes, true));
                }
                WaitResult::TakenOver => {
                    // The previous generator vanished; the lock is ours.
                }
                WaitResult::TimedOut => {
                    self.inner.metrics.stampede_timeouts.inc();
                    return Err(AppError::ServerTooBusy);
                }
            }
        }

        let result = self.generate(spec, fingerprint, opts).await;
        self.inner.cache.release_generation_lock(fingerprint).await;
        result.map(|bytes| (bytes, false))
    }

    /// Generate one derivative, lock already held.
    async fn generate(
        &self,
        spec: &ImageSpec,
        fingerprint: &str,
        opts: &DeliveryOpts,
    ) -> AppResult<Vec<u8>> {
        let (base_bytes, base_spec, from_original) = self.find_base(spec).await?;

        // A raw-original base may warrant a background pyramid.
        if from_original {
            self.maybe_schedule_pyramid(spec, &base_bytes).await;
        }

        let bytes = self
            .adjust(&base_bytes, &base_spec, spec, fingerprint)
            .await?;

        if opts.use_cache {
            self.inner.cache.put_image(fingerprint, spec, &bytes).await;
        }
        Ok(bytes)
    }

    /// Find the best cached base, falling back to the raw original.
    /// Returns (bytes, the spec baked into them, was-original).
    fn find_base<'a>(
        &'a self,
        spec: &'a ImageSpec,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = AppResult<(Vec<u8>, ImageSpec, bool)>> + Send + 'a>,
    > {
        Box::pin(async move {
            let group = attr_group_hash(spec);
            let min_w = spec.width.map_or(UNSET_DIM_INDEX, i64::from);
            let min_h = spec.height.map_or(UNSET_DIM_INDEX, i64::from);

            let candidates = self
                .inner
                .cache
                .search_base_candidates(spec.source_id, group, min_w, min_h)
                .await;

            for (entry, base_spec) in candidates {
                if suitable_for(&base_spec, spec).is_ok() {
                    if let Some(bytes) = self.inner.cache.get_image(&entry.key).await {
                        if CacheManager::as_error(&bytes).is_none() {
                            debug!(base = %entry.key, "reusing cached base image");
                            return Ok((bytes, base_spec, false));
                        }
                    }
                }
            }

            // A tile with no base at its exact size first gets its untiled
            // derivative generated synchronously.
            if spec.tile.is_some() {
                if let Some((bytes, base_spec)) = self.tile_base(spec).await? {
                    return Ok((bytes, base_spec, false));
                }
            }

            let bytes = match self.inner.storage.read(&spec.source).await {
                Ok(bytes) => bytes,
                Err(AppError::NotFound(p)) => {
                    self.heal_missing(&spec.source, spec.source_id).await;
                    return Err(AppError::NotFound(p));
                }
                Err(e) => return Err(e),
            };

            let mut original = ImageSpec::for_source(spec.source.clone());
            original.source_id = spec.source_id;
            Ok((bytes, original, true))
        })
    }

    /// Find or synchronously build the untiled derivative a tile request
    /// cuts from. A marker prevents repeated synchronous builds for the
    /// same fingerprint after the untiled version evicts.
    async fn tile_base(&self, spec: &ImageSpec) -> AppResult<Option<(Vec<u8>, ImageSpec)>> {
        let mut untiled = spec.clone();
        untiled.tile = None;
        let untiled_fp = untiled.fingerprint()?;

        if let Some(bytes) = self.inner.cache.get_image(&untiled_fp).await {
            if CacheManager::as_error(&bytes).is_none() {
                return Ok(Some((bytes, untiled)));
            }
        }

        let marker = CacheManager::tile_base_marker(&untiled_fp);
        if self.inner.cache.has_marker(&marker).await {
            // Built once already; let the original serve this round.
            return Ok(None);
        }

        debug!(fp = %untiled_fp, "generating tile base synchronously");
        // find_base returns a boxed future to break the find_base -> tile_base -> find_base cycle.
        let (base_bytes, base_spec, _) = self.find_base(&untiled).await?;
        let bytes = self
            .adjust(&base_bytes, &base_spec, &untiled, &untiled_fp)
            .await?;
        self.inner.cache.put_image(&untiled_fp, &untiled, &bytes).await;
        self.inner.cache.add_marker(&marker).await;

        Ok(Some((bytes, untiled)))
    }

    /// Run the codec on a blocking thread, bounded by the permit pool.
    /// Codec failures are cached as error markers so repeats fail fast.
    async fn adjust(
        &self,
        base_bytes: &[u8],
        base_spec: &ImageSpec,
        target: &ImageSpec,
        fingerprint: &str,
    ) -> AppResult<Vec<u8>> {
        let resources = self.delta_resources(target).await?;
        let ops = delta_ops(base_spec, target, resources);
        let hint = target.src_extension();

        let _permit = self
            .inner
            .adjust_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::ServerTooBusy)?;

        let codec = Arc::clone(&self.inner.codec);
        let input = base_bytes.to_vec();
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || codec.adjust(&input, &hint, &ops))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("codec task panicked: {e}")))?;

        self.inner
            .metrics
            .generation_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                let message = match &err {
                    CodecError::Decode(m) | CodecError::Encode(m) => m.clone(),
                    CodecError::Unsupported(op) => format!("unsupported operation: {op}"),
                };
                warn!(fp = %fingerprint, error = %message, "codec failed, caching error marker");
                self.inner
                    .cache
                    .put_error(fingerprint, target, &message)
                    .await;
                Err(AppError::Image(message))
            }
        }
    }

    /// Load the byte resources the delta needs: overlay image and ICC
    /// profile data.
    async fn delta_resources(&self, target: &ImageSpec) -> AppResult<DeltaResources> {
        let overlay_bytes = match &target.overlay_src {
            Some(src) => Some(self.inner.storage.read(src).await?),
            None => None,
        };
        let icc_data = target
            .icc_profile
            .as_ref()
            .and_then(|name| self.inner.icc.get(name))
            .map(|data| data.as_ref().clone());

        Ok(DeltaResources {
            overlay_bytes,
            icc_data,
            default_quality: self.inner.default_quality,
        })
    }

    // ---- auto-pyramid --------------------------------------------------

    /// Schedule a background pyramid build when a tile request had to
    /// fall back to the raw original of a large image.
    async fn maybe_schedule_pyramid(&self, spec: &ImageSpec, original: &[u8]) {
        if !spec.is_tiled() || spec.overlay_src.is_some() {
            return;
        }

        let Ok((w, h)) = self
            .inner
            .codec
            .dimensions(original, &spec.src_extension())
        else {
            return;
        };
        if u64::from(w) * u64::from(h) < self.inner.pyramid_pixel_threshold {
            return;
        }

        // A pyramid of a huge original would evict more than it saves.
        let usage = self.inner.cache.usage().await;
        if usage.capacity_bytes > 0 && (original.len() as u64) * 20 > usage.capacity_bytes {
            return;
        }

        let pyramid_spec = pyramid_level_spec(spec, 0, 0);
        let group = attr_group_hash(&pyramid_spec);
        let marker = CacheManager::pyramid_marker(spec.source_id, group);
        // Atomic add: concurrent requests elect a single scheduler.
        if !self.inner.cache.add_marker(&marker).await {
            return;
        }

        let params = TaskParams::BuildPyramid {
            image_id: spec.source_id,
            format: spec.format.clone().unwrap_or_default(),
        };
        if let Err(e) = self
            .inner
            .tasks
            .submit(
                &format!("Build pyramid for {}", spec.source),
                &params,
                TaskPriority::Low,
                60,
                None,
            )
            .await
        {
            warn!(error = %e, "failed to schedule pyramid build");
        }
    }

    /// Build the pyramid: progressively halved derivatives, each level
    /// generated from the previous one. Runs inside the task worker.
    pub async fn build_pyramid(&self, image_id: i64, format: &str) -> AppResult<u32> {
        let record = ImageRecord::find_by_id(&self.inner.pool, image_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("image {image_id}")))?;

        let original = self.inner.storage.read(&record.src).await?;
        let src_spec = {
            let mut s = ImageSpec::for_source(record.src.clone());
            s.source_id = image_id;
            s
        };
        let (mut w, mut h) = self
            .inner
            .codec
            .dimensions(&original, &src_spec.src_extension())
            .map_err(|e| AppError::Image(e.to_string()))?;

        ImageRecord::set_dimensions(&self.inner.pool, image_id, w, h).await?;

        let mut prev_bytes = original;
        let mut prev_spec = src_spec.clone();
        let mut levels = 0u32;

        loop {
            w /= 2;
            h /= 2;
            if w == 0 || h == 0 {
                break;
            }

            let mut level = pyramid_level_spec(&src_spec, w, h);
            if !format.is_empty() {
                level.format = Some(format.to_string());
            }
            level.normalise();
            let fp = level.fingerprint()?;

            match self.inner.cache.get_image(&fp).await {
                Some(bytes) => prev_bytes = bytes,
                None => {
                    let bytes = self
                        .adjust(&prev_bytes, &prev_spec, &level, &fp)
                        .await?;
                    self.inner.cache.put_image(&fp, &level, &bytes).await;
                    prev_bytes = bytes;
                }
            }
            prev_spec = level;
            levels += 1;

            // Stop once the level has dropped below the threshold.
            if u64::from(w) * u64::from(h) < self.inner.pyramid_pixel_threshold {
                break;
            }
        }

        info!(image_id, levels, "pyramid built");
        Ok(levels)
    }
}

/// The folder portion of a source path.
fn folder_of(src: &str) -> String {
    match src.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

/// The download filename: source stem with the output extension.
fn filename_for(src: &str, format: &str) -> String {
    let name = src.rsplit('/').next().unwrap_or(src);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    format!("{stem}.{format}")
}

/// A stable entity tag from the fingerprint and modification time.
fn etag_for(fingerprint: &str, modified: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(modified.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// The spec of one pyramid level (or, with zero dims, the group probe
/// used for the "pyramid done" marker).
fn pyramid_level_spec(spec: &ImageSpec, w: u32, h: u32) -> ImageSpec {
    let mut level = ImageSpec::for_source(spec.source.clone());
    level.source_id = spec.source_id;
    level.format = spec.format.clone();
    if w > 0 {
        level.width = Some(w);
    }
    if h > 0 {
        level.height = Some(h);
    }
    level
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn folder_extraction() {
        assert_eq!(folder_of("test_images/cathedral.jpg"), "test_images");
        assert_eq!(folder_of("a/b/c.png"), "a/b");
        assert_eq!(folder_of("c.png"), "");
    }

    #[test]
    fn filenames_swap_extension() {
        assert_eq!(
            filename_for("test_images/cathedral.jpg", "png"),
            "cathedral.png"
        );
        assert_eq!(filename_for("noext", "jpg"), "noext.jpg");
    }

    #[test]
    fn etags_are_stable_and_sensitive() {
        let a = etag_for("IMG:42,w200", 1000);
        let b = etag_for("IMG:42,w200", 1000);
        let c = etag_for("IMG:42,w200", 1001);
        let d = etag_for("IMG:42,w201", 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }
}
