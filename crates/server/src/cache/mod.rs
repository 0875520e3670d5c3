//! Derivative cache.
//!
//! Two layers over a commodity key/value store: a chunked blob store in
//! Redis holding the derivative bytes, and a searchable control table in
//! Postgres that answers the base-image query. The manager on top adds
//! stampede control, a rarely-used global lock, per-derivative metadata
//! records and invalidation.

mod index;
mod store;

pub use index::{CacheIndex, IndexEntry, SEARCH_LIMIT};
pub use store::{BlobStore, CacheUsage, MAX_CHUNKS, SLOT_SIZE};

use std::time::Duration;

use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::spec::{attr_group_hash, ImageSpec};

/// Prefix marking a cached codec failure; repeat requests for a
/// known-bad derivative fail fast without re-entering the codec.
pub const ERROR_SENTINEL: &[u8] = b"*ERROR*";

/// Dimension stored in the index when the spec leaves it unset, so that
/// "width >= X" range queries match full-size derivatives.
pub const UNSET_DIM_INDEX: i64 = 999_999;

/// Group hash stored for error sentinels; the base search never matches
/// it because real group hashes are non-negative.
const ERROR_GROUP: i64 = -1;

/// Key of the cross-process global lock.
const GLOBAL_LOCK_KEY: &str = "GLOBAL_LOCK";

/// TTL of the global lock.
const GLOBAL_LOCK_TTL_SECS: u64 = 60;

/// Per-derivative metadata stored under the metadata fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMeta {
    /// Unix timestamp of the derivative's last modification.
    pub modified: i64,
}

/// Outcome of waiting on another worker's generation lock.
#[derive(Debug)]
pub enum WaitResult {
    /// The other worker finished; here are its bytes.
    Ready(Vec<u8>),
    /// The lock vanished without a result; the waiter now holds it and
    /// must generate.
    TakenOver,
    /// The wait budget expired.
    TimedOut,
}

/// The cache manager: blob store + index + locks.
pub struct CacheManager {
    store: BlobStore,
    index: CacheIndex,
    /// Configured stampede wait, before clamping.
    wait_secs: u64,
}

impl CacheManager {
    pub fn new(redis: RedisClient, pool: PgPool, wait_secs: u64) -> Self {
        Self {
            store: BlobStore::new(redis),
            index: CacheIndex::new(pool),
            wait_secs,
        }
    }

    /// The stampede wait budget, clamped to [10, 120] seconds.
    pub fn wait_budget_secs(&self) -> u64 {
        self.wait_secs.clamp(10, 120)
    }

    fn lock_key(fingerprint: &str) -> String {
        format!("LOCK:{fingerprint}")
    }

    /// The metadata key paired with a derivative fingerprint.
    fn meta_key(fingerprint: &str) -> String {
        match fingerprint.strip_prefix("IMG:") {
            Some(rest) => format!("MET:{rest}"),
            None => format!("MET:{fingerprint}"),
        }
    }

    // ---- derivative bytes ----------------------------------------------

    /// Exact-key cache probe. Store failures read as misses.
    pub async fn get_image(&self, fingerprint: &str) -> Option<Vec<u8>> {
        match self.store.get(fingerprint).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, key = %fingerprint, "cache read failed");
                None
            }
        }
    }

    /// Store a derivative with its index row and metadata record.
    pub async fn put_image(&self, fingerprint: &str, spec: &ImageSpec, bytes: &[u8]) {
        if let Err(e) = self.store.put(fingerprint, bytes, None).await {
            warn!(error = %e, key = %fingerprint, "cache write failed");
            return;
        }

        let entry = IndexEntry {
            key: fingerprint.to_string(),
            valuesize: bytes.len() as i64,
            f1: spec.source_id,
            f2: attr_group_hash(spec),
            f3: spec.width.map_or(UNSET_DIM_INDEX, i64::from),
            f4: spec.height.map_or(UNSET_DIM_INDEX, i64::from),
            f5: 0,
            extra: serde_json::to_value(spec).ok(),
        };
        if let Err(e) = self.index.upsert(&entry).await {
            warn!(error = %e, key = %fingerprint, "cache index write failed");
        }

        self.touch_meta(fingerprint).await;
    }

    /// Cache a codec failure so repeat requests fail fast.
    pub async fn put_error(&self, fingerprint: &str, spec: &ImageSpec, message: &str) {
        let mut sentinel = ERROR_SENTINEL.to_vec();
        sentinel.extend_from_slice(message.as_bytes());
        if let Err(e) = self.store.put(fingerprint, &sentinel, None).await {
            warn!(error = %e, key = %fingerprint, "error sentinel write failed");
            return;
        }
        let entry = IndexEntry {
            key: fingerprint.to_string(),
            valuesize: sentinel.len() as i64,
            f1: spec.source_id,
            f2: ERROR_GROUP,
            f3: 0,
            f4: 0,
            f5: 0,
            extra: None,
        };
        if let Err(e) = self.index.upsert(&entry).await {
            warn!(error = %e, key = %fingerprint, "error sentinel index write failed");
        }
    }

    /// Decode an error-sentinel payload, if that is what these bytes are.
    pub fn as_error(bytes: &[u8]) -> Option<String> {
        bytes
            .strip_prefix(ERROR_SENTINEL)
            .map(|msg| String::from_utf8_lossy(msg).to_string())
    }

    // ---- metadata ------------------------------------------------------

    /// Record "this derivative changed now" under the metadata key.
    pub async fn touch_meta(&self, fingerprint: &str) {
        let meta = CachedMeta {
            modified: chrono::Utc::now().timestamp(),
        };
        let Ok(body) = serde_json::to_vec(&meta) else {
            return;
        };
        if let Err(e) = self
            .store
            .put_raw(&Self::meta_key(fingerprint), &body, None)
            .await
        {
            warn!(error = %e, key = %fingerprint, "metadata write failed");
        }
    }

    /// Fetch a derivative's metadata record.
    pub async fn get_meta(&self, fingerprint: &str) -> Option<CachedMeta> {
        let body = self
            .store
            .get_raw(&Self::meta_key(fingerprint))
            .await
            .ok()
            .flatten()?;
        serde_json::from_slice(&body).ok()
    }

    // ---- stampede control ----------------------------------------------

    /// Try to become the single generator for a fingerprint. The lock is
    /// created with atomic-add semantics and a TTL strictly above the
    /// wait budget of any observer.
    pub async fn acquire_generation_lock(&self, fingerprint: &str) -> bool {
        let ttl = self.wait_budget_secs() + 30;
        match self
            .store
            .add_raw(&Self::lock_key(fingerprint), b"1", Some(ttl))
            .await
        {
            Ok(won) => won,
            Err(e) => {
                // An unreachable cache must not wedge the request; act
                // as the generator and regenerate.
                warn!(error = %e, "generation lock unavailable, proceeding");
                true
            }
        }
    }

    pub async fn release_generation_lock(&self, fingerprint: &str) {
        if let Err(e) = self.store.delete_raw(&Self::lock_key(fingerprint)).await {
            warn!(error = %e, "failed to release generation lock");
        }
    }

    /// Busy-wait for another worker's result: re-read the primary key at
    /// ~1 Hz until it appears or the wait budget expires.
    pub async fn wait_for_image(&self, fingerprint: &str) -> WaitResult {
        let budget = self.wait_budget_secs();
        for _ in 0..budget {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(bytes) = self.get_image(fingerprint).await {
                return WaitResult::Ready(bytes);
            }
            // The generator may have failed and dropped its lock; take
            // over rather than waiting out the budget.
            if self.acquire_generation_lock(fingerprint).await {
                return WaitResult::TakenOver;
            }
        }
        WaitResult::TimedOut
    }

    /// Whether a generation lock is currently held for a fingerprint.
    pub async fn generation_lock_held(&self, fingerprint: &str) -> bool {
        matches!(
            self.store.get_raw(&Self::lock_key(fingerprint)).await,
            Ok(Some(_))
        )
    }

    // ---- markers -------------------------------------------------------

    /// Set a marker key; only the first caller wins.
    pub async fn add_marker(&self, key: &str) -> bool {
        match self.store.add_raw(key, b"1", None).await {
            Ok(won) => won,
            Err(e) => {
                warn!(error = %e, key = %key, "marker write failed");
                false
            }
        }
    }

    pub async fn has_marker(&self, key: &str) -> bool {
        matches!(self.store.get_raw(key).await, Ok(Some(_)))
    }

    /// The "pyramid built" marker for one (source, attribute group).
    pub fn pyramid_marker(source_id: i64, group_hash: i64) -> String {
        format!("PYR:{source_id}:{group_hash}")
    }

    /// The "tile base generated" marker for one untiled fingerprint.
    pub fn tile_base_marker(fingerprint: &str) -> String {
        format!("TBASE:{fingerprint}")
    }

    // ---- global lock ---------------------------------------------------

    /// Acquire the cross-process global lock, spinning with backoff.
    /// Used only for schema-style operations, never on the hot path.
    /// When the cache is unreachable the caller falls through silently.
    pub async fn acquire_global_lock(&self) -> bool {
        for attempt in 0u32..10 {
            match self
                .store
                .add_raw(GLOBAL_LOCK_KEY, b"1", Some(GLOBAL_LOCK_TTL_SECS))
                .await
            {
                Ok(true) => return true,
                Ok(false) => {
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
                }
                Err(e) => {
                    warn!(error = %e, "cache unreachable for global lock, falling through");
                    return true;
                }
            }
        }
        false
    }

    pub async fn release_global_lock(&self) {
        if let Err(e) = self.store.delete_raw(GLOBAL_LOCK_KEY).await {
            warn!(error = %e, "failed to release global lock");
        }
    }

    // ---- search and invalidation ---------------------------------------

    /// Candidate base images for (source, attribute group) at or above
    /// the given dimensions, tightest first, with their parsed specs.
    pub async fn search_base_candidates(
        &self,
        source_id: i64,
        group_hash: i64,
        min_width: i64,
        min_height: i64,
    ) -> Vec<(IndexEntry, ImageSpec)> {
        let rows = match self
            .index
            .search_base(source_id, group_hash, min_width, min_height)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "base search failed");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| {
                let spec: ImageSpec = serde_json::from_value(row.extra.clone()?).ok()?;
                Some((row, spec))
            })
            .collect()
    }

    /// Remove one derivative: bytes, metadata, index row and any
    /// stampede lock.
    pub async fn invalidate_fingerprint(&self, fingerprint: &str) {
        if let Err(e) = self.store.delete(fingerprint).await {
            warn!(error = %e, key = %fingerprint, "failed to delete blob");
        }
        if let Err(e) = self.store.delete_raw(&Self::meta_key(fingerprint)).await {
            warn!(error = %e, "failed to delete metadata");
        }
        if let Err(e) = self.store.delete_raw(&Self::lock_key(fingerprint)).await {
            warn!(error = %e, "failed to delete lock");
        }
        if let Err(e) = self
            .store
            .delete_raw(&Self::tile_base_marker(fingerprint))
            .await
        {
            warn!(error = %e, "failed to delete tile-base marker");
        }
        if let Err(e) = self.index.remove(fingerprint).await {
            warn!(error = %e, "failed to delete index row");
        }
    }

    /// Remove every cached derivative of one source, along with its
    /// metadata records, locks and pyramid markers.
    pub async fn invalidate_source(&self, source_id: i64) {
        let rows = match self.index.search_source(source_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, source_id, "source invalidation search failed");
                return;
            }
        };

        let mut groups: Vec<i64> = Vec::new();
        for row in &rows {
            if row.f2 >= 0 && !groups.contains(&row.f2) {
                groups.push(row.f2);
            }
            self.invalidate_fingerprint(&row.key).await;
        }

        for group in groups {
            if let Err(e) = self
                .store
                .delete_raw(&Self::pyramid_marker(source_id, group))
                .await
            {
                warn!(error = %e, "failed to delete pyramid marker");
            }
        }

        debug!(source_id, entries = rows.len(), "source invalidated");
    }

    /// Drop the whole cache: blobs, control rows, locks, markers.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.store.flush().await?;
        self.index.clear().await?;
        Ok(())
    }

    /// Capacity and usage of the blob store.
    pub async fn usage(&self) -> CacheUsage {
        match self.store.usage().await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "cache stats unavailable");
                CacheUsage::default()
            }
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn meta_key_swaps_prefix() {
        assert_eq!(CacheManager::meta_key("IMG:42,w200"), "MET:42,w200");
        assert_eq!(CacheManager::meta_key("other"), "MET:other");
    }

    #[test]
    fn error_sentinel_round_trip() {
        let mut sentinel = ERROR_SENTINEL.to_vec();
        sentinel.extend_from_slice(b"decode failed");
        assert_eq!(
            CacheManager::as_error(&sentinel).as_deref(),
            Some("decode failed")
        );
        assert_eq!(CacheManager::as_error(b"plain image bytes"), None);
    }

    #[test]
    fn marker_keys() {
        assert_eq!(CacheManager::pyramid_marker(42, 9), "PYR:42:9");
        assert_eq!(
            CacheManager::tile_base_marker("IMG:42,w200"),
            "TBASE:IMG:42,w200"
        );
    }
}
