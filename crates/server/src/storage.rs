//! Blob store for original images.
//!
//! A rooted filesystem namespace: every path is validated component by
//! component before any I/O, and escapes (`..`, absolute paths, null
//! bytes) are rejected with a security error.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

/// File metadata returned by `stat`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// What `path_exists` should require of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Require {
    File,
    Directory,
}

/// Validate a relative path to prevent directory traversal.
///
/// Component-by-component rather than substring matching, so that
/// normalisation tricks cannot bypass it.
pub fn validate_path(path: &str) -> bool {
    if path.contains('\0') {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return false;
    }
    for component in path.split(['/', '\\']) {
        if component == ".." || component == "." {
            return false;
        }
    }
    true
}

/// Collapse duplicate separators and trim the ends: `/a//b/` -> `a/b`.
pub fn normalise_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read-only-rooted access to the original images.
pub struct ImageStorage {
    root: PathBuf,
}

impl ImageStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path inside the images root, or fail with a
    /// security error before touching the filesystem.
    fn resolve(&self, rel: &str) -> AppResult<PathBuf> {
        if !validate_path(rel) {
            return Err(AppError::Security(format!(
                "path '{rel}' is outside the images root"
            )));
        }
        Ok(self.root.join(rel))
    }

    /// Check whether a path exists as a file or directory.
    pub async fn path_exists(&self, rel: &str, require: Require) -> AppResult<bool> {
        let path = self.resolve(rel)?;
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(AppError::Internal(e.into())),
        };
        Ok(match require {
            Require::File => meta.is_file(),
            Require::Directory => meta.is_dir(),
        })
    }

    /// Read a source image.
    pub async fn read(&self, rel: &str) -> AppResult<Vec<u8>> {
        let path = self.resolve(rel)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!(path = %rel, size = data.len(), "original read");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(rel.to_string()))
            }
            Err(e) => Err(AppError::Internal(
                anyhow::Error::from(e).context(format!("failed to read '{rel}'")),
            )),
        }
    }

    /// Write a file into a directory inside the root.
    pub async fn write(
        &self,
        data: &[u8],
        dir: &str,
        name: &str,
        allow_create: bool,
        overwrite: bool,
    ) -> AppResult<String> {
        if !validate_path(name) || name.contains('/') {
            return Err(AppError::Security(format!("bad file name '{name}'")));
        }
        let rel = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", normalise_path(dir), name)
        };
        let path = self.resolve(&rel)?;

        if let Some(parent) = path.parent() {
            let parent_exists = fs::metadata(parent).await.is_ok();
            if !parent_exists {
                if !allow_create {
                    return Err(AppError::NotFound(dir.to_string()));
                }
                fs::create_dir_all(parent)
                    .await
                    .context("failed to create directories")?;
            }
        }

        if !overwrite && fs::metadata(&path).await.is_ok() {
            return Err(AppError::AlreadyExists(rel.clone()));
        }

        let mut file = fs::File::create(&path)
            .await
            .context("failed to create file")?;
        file.write_all(data).await.context("failed to write file")?;
        file.flush().await.context("failed to flush file")?;

        debug!(path = %rel, size = data.len(), "original written");
        Ok(rel)
    }

    /// List the entries of a directory inside the root.
    pub async fn list(&self, rel: &str) -> AppResult<Vec<String>> {
        let path = self.resolve(rel)?;
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(AppError::Internal(e.into())),
        };
        while let Some(entry) = dir.next_entry().await.context("failed to list directory")? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Size and mtime of a file.
    pub async fn stat(&self, rel: &str) -> AppResult<FileStat> {
        let path = self.resolve(rel)?;
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(AppError::Internal(e.into())),
        };
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FileStat {
            size: meta.len(),
            modified,
        })
    }

    /// Delete a file.
    pub async fn delete(&self, rel: &str) -> AppResult<()> {
        let path = self.resolve(rel)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %rel, "original deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %rel, "file not found for deletion");
                Ok(())
            }
            Err(e) => Err(AppError::Internal(e.into())),
        }
    }

    /// Rename a file or directory inside the root.
    pub async fn rename(&self, from: &str, to: &str) -> AppResult<()> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("failed to create target directories")?;
        }
        fs::rename(&from_path, &to_path)
            .await
            .with_context(|| format!("failed to rename '{from}' to '{to}'"))?;
        debug!(from = %from, to = %to, "renamed");
        Ok(())
    }

    /// Create a directory (and parents) inside the root.
    pub async fn mkdir(&self, rel: &str) -> AppResult<()> {
        let path = self.resolve(rel)?;
        fs::create_dir_all(&path)
            .await
            .context("failed to create directory")?;
        debug!(path = %rel, "directory created");
        Ok(())
    }

    /// Remove a directory tree inside the root.
    pub async fn remove_dir_all(&self, rel: &str) -> AppResult<()> {
        if rel.is_empty() {
            return Err(AppError::Security("refusing to remove the images root".into()));
        }
        let path = self.resolve(rel)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Internal(e.into())),
        }
    }
}

impl std::fmt::Debug for ImageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStorage")
            .field("root", &self.root)
            .finish()
    }
}
