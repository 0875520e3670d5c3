//! Permission oracle.
//!
//! Resolves (user, folder, access level) -> allow/deny by walking the
//! folder tree to the nearest folder carrying a permission record for
//! each of the user's groups, taking the highest access across groups.
//!
//! Results are cached per process in a DashMap, stamped with the global
//! permission version. Any permission change bumps a counter in the
//! database (under the cross-process global lock); entries carrying an
//! old version are ignored. A refresh mutex stops a thundering herd of
//! version reloads when the counter moves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::error::{AppError, AppResult};
use crate::models::group::PUBLIC_GROUP_ID;
use crate::models::{property, Folder, FolderPermission, User};

/// Folder access levels, lowest to highest. Each level implies the ones
/// below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None = 0,
    View = 10,
    Download = 20,
    Edit = 30,
    Upload = 40,
    Delete = 50,
    CreateFolder = 60,
    DeleteFolder = 70,
}

impl Access {
    pub fn from_i16(v: i16) -> Access {
        match v {
            v if v >= 70 => Access::DeleteFolder,
            v if v >= 60 => Access::CreateFolder,
            v if v >= 50 => Access::Delete,
            v if v >= 40 => Access::Upload,
            v if v >= 30 => Access::Edit,
            v if v >= 20 => Access::Download,
            v if v >= 10 => Access::View,
            _ => Access::None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// How often the permission version is re-read from the database.
const VERSION_TTL: Duration = Duration::from_secs(10);

/// One line of a permission trace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceEntry {
    pub folder_path: String,
    pub group_id: Uuid,
    pub access: i16,
}

struct VersionState {
    value: i64,
    checked: Instant,
}

struct OracleInner {
    pool: PgPool,
    cache: Arc<CacheManager>,
    /// (user key, folder path) -> (version, resolved access).
    folder_cache: DashMap<(String, String), (i64, Access)>,
    version: parking_lot::Mutex<VersionState>,
    /// Serialises version refreshes.
    refresh_lock: tokio::sync::Mutex<()>,
}

/// The permission oracle.
#[derive(Clone)]
pub struct PermissionOracle {
    inner: Arc<OracleInner>,
}

impl PermissionOracle {
    pub fn new(pool: PgPool, cache: Arc<CacheManager>) -> Self {
        Self {
            inner: Arc::new(OracleInner {
                pool,
                cache,
                folder_cache: DashMap::new(),
                version: parking_lot::Mutex::new(VersionState {
                    value: 0,
                    checked: Instant::now()
                        .checked_sub(VERSION_TTL * 2)
                        .unwrap_or_else(Instant::now),
                }),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// System-level flags. Only administrators hold them.
    pub fn has_system(&self, user: Option<&User>) -> bool {
        user.is_some_and(|u| u.is_admin && u.is_active())
    }

    /// Whether the user (or the public, when None) holds at least
    /// `required` access on the folder at `folder_path`.
    pub async fn has_folder(
        &self,
        user: Option<&User>,
        folder_path: &str,
        required: Access,
        may_not_exist: bool,
    ) -> AppResult<bool> {
        if self.has_system(user) {
            return Ok(true);
        }

        let user_key = user.map_or_else(|| "public".to_string(), |u| u.id.to_string());
        let path = crate::storage::normalise_path(folder_path);
        let version = self.current_version().await?;

        if let Some(entry) = self.inner.folder_cache.get(&(user_key.clone(), path.clone())) {
            let (cached_version, access) = *entry;
            if cached_version == version {
                return Ok(access >= required);
            }
        }

        let access = self
            .resolve_access(user, &path, may_not_exist)
            .await?;

        self.inner
            .folder_cache
            .insert((user_key, path), (version, access));

        Ok(access >= required)
    }

    /// Resolve and require: error with `Security` when denied.
    pub async fn require_folder(
        &self,
        user: Option<&User>,
        folder_path: &str,
        required: Access,
    ) -> AppResult<()> {
        if self.has_folder(user, folder_path, required, false).await? {
            Ok(())
        } else {
            Err(AppError::Security(format!(
                "no access to folder '{folder_path}'"
            )))
        }
    }

    /// Diagnostic: every permission record met while walking from the
    /// folder to the root, for the user's groups.
    pub async fn trace_folder(
        &self,
        user: Option<&User>,
        folder_path: &str,
    ) -> AppResult<Vec<TraceEntry>> {
        let groups = self.groups_of(user).await?;
        let mut trace = Vec::new();

        let mut folder = self.nearest_folder(folder_path, true).await?;
        loop {
            let rows = FolderPermission::for_folder(&self.inner.pool, folder.id, &groups).await?;
            for row in rows {
                trace.push(TraceEntry {
                    folder_path: folder.path.clone(),
                    group_id: row.group_id,
                    access: row.access,
                });
            }
            match folder.parent_id {
                Some(parent) => {
                    folder = Folder::find_by_id(&self.inner.pool, parent)
                        .await?
                        .ok_or_else(|| AppError::NotFound("parent folder".into()))?;
                }
                None => break,
            }
        }

        Ok(trace)
    }

    /// Bump the global permission version. Called after any permission
    /// mutation; all processes observe the change through the counter.
    pub async fn bump_version(&self) -> AppResult<()> {
        let locked = self.inner.cache.acquire_global_lock().await;
        let result = property::increment(&self.inner.pool, property::PERMISSIONS_VERSION).await;
        if locked {
            self.inner.cache.release_global_lock().await;
        }

        let new_version = result?;
        self.inner.folder_cache.clear();
        let mut state = self.inner.version.lock();
        state.value = new_version;
        state.checked = Instant::now();

        info!(version = new_version, "permission version bumped");
        Ok(())
    }

    /// The cached permission version, re-read at most every few seconds
    /// and refreshed by at most one task at a time.
    async fn current_version(&self) -> AppResult<i64> {
        {
            let state = self.inner.version.lock();
            if state.checked.elapsed() < VERSION_TTL {
                return Ok(state.value);
            }
        }

        let _guard = self.inner.refresh_lock.lock().await;
        // Another task may have refreshed while we queued for the lock.
        {
            let state = self.inner.version.lock();
            if state.checked.elapsed() < VERSION_TTL {
                return Ok(state.value);
            }
        }

        let value =
            property::get_version(&self.inner.pool, property::PERMISSIONS_VERSION).await?;
        let mut state = self.inner.version.lock();
        state.value = value;
        state.checked = Instant::now();
        debug!(version = value, "permission version refreshed");
        Ok(value)
    }

    async fn groups_of(&self, user: Option<&User>) -> AppResult<Vec<Uuid>> {
        let mut groups = vec![PUBLIC_GROUP_ID];
        if let Some(user) = user {
            groups.extend(User::group_ids(&self.inner.pool, user.id).await?);
        }
        Ok(groups)
    }

    /// The folder at `path`, or its nearest existing ancestor when
    /// `may_not_exist` allows it.
    async fn nearest_folder(&self, path: &str, may_not_exist: bool) -> AppResult<Folder> {
        let mut candidate = crate::storage::normalise_path(path);
        loop {
            if let Some(folder) = Folder::find_by_path(&self.inner.pool, &candidate).await? {
                return Ok(folder);
            }
            if !may_not_exist {
                return Err(AppError::NotFound(format!("folder '{path}'")));
            }
            match candidate.rfind('/') {
                Some(idx) => candidate.truncate(idx),
                None if !candidate.is_empty() => candidate.clear(),
                None => return Err(AppError::NotFound("root folder".into())),
            }
        }
    }

    /// Walk from the folder to the root; for each group, the nearest
    /// folder with a record decides that group's access. The user's
    /// access is the highest across groups.
    async fn resolve_access(
        &self,
        user: Option<&User>,
        path: &str,
        may_not_exist: bool,
    ) -> AppResult<Access> {
        let groups = self.groups_of(user).await?;
        let mut undecided: Vec<Uuid> = groups.clone();
        let mut best = Access::None;

        let mut folder = self.nearest_folder(path, may_not_exist).await?;
        loop {
            if undecided.is_empty() {
                break;
            }
            let rows =
                FolderPermission::for_folder(&self.inner.pool, folder.id, &undecided).await?;
            for row in rows {
                undecided.retain(|g| *g != row.group_id);
                best = best.max(Access::from_i16(row.access));
            }
            match folder.parent_id {
                Some(parent) => {
                    folder = Folder::find_by_id(&self.inner.pool, parent)
                        .await?
                        .ok_or_else(|| AppError::NotFound("parent folder".into()))?;
                }
                None => break,
            }
        }

        Ok(best)
    }

    /// Number of cached entries (for monitoring).
    pub fn cache_size(&self) -> usize {
        self.inner.folder_cache.len()
    }
}

impl std::fmt::Debug for PermissionOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionOracle").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_ordered() {
        assert!(Access::View < Access::Download);
        assert!(Access::Download < Access::Edit);
        assert!(Access::DeleteFolder > Access::CreateFolder);
        assert_eq!(Access::from_i16(10), Access::View);
        assert_eq!(Access::from_i16(0), Access::None);
        assert_eq!(Access::from_i16(75), Access::DeleteFolder);
        assert_eq!(Access::from_i16(15), Access::View);
    }

    #[test]
    fn round_trips_through_i16() {
        for access in [
            Access::None,
            Access::View,
            Access::Download,
            Access::Edit,
            Access::Upload,
            Access::Delete,
            Access::CreateFolder,
            Access::DeleteFolder,
        ] {
            assert_eq!(Access::from_i16(access.as_i16()), access);
        }
    }
}
