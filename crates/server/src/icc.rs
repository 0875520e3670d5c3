//! ICC colour profile registry.
//!
//! Profiles are loaded once from a configured directory at startup and
//! looked up by their lowercase file stem.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

/// Registry of named ICC colour profiles.
pub struct IccRegistry {
    profiles: HashMap<String, Arc<Vec<u8>>>,
}

impl IccRegistry {
    /// Load every `.icc`/`.icm` file in a directory. A missing directory
    /// is an empty registry.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut profiles = HashMap::new();

        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase);
                if !matches!(ext.as_deref(), Some("icc" | "icm")) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match std::fs::read(&path) {
                    Ok(data) => {
                        profiles.insert(stem.to_lowercase(), Arc::new(data));
                    }
                    Err(e) => {
                        warn!(profile = %stem, error = %e, "failed to read ICC profile");
                    }
                }
            }
        }

        info!(dir = %dir.display(), count = profiles.len(), "ICC profiles loaded");
        Ok(Self { profiles })
    }

    /// Look up a profile's data by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.profiles.get(&name.to_lowercase()).cloned()
    }

    /// Whether a profile with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(&name.to_lowercase())
    }

    /// Names of all loaded profiles.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for IccRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IccRegistry")
            .field("count", &self.profiles.len())
            .finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_profiles_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GreyFit.icc"), b"fake profile data").unwrap();
        std::fs::write(dir.path().join("print.icm"), b"more data").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let registry = IccRegistry::load(dir.path()).unwrap();
        assert!(registry.contains("greyfit"));
        assert!(registry.contains("GREYFIT"));
        assert!(registry.contains("print"));
        assert!(!registry.contains("notes"));
        assert_eq!(registry.get("greyfit").unwrap().as_slice(), b"fake profile data");
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = IccRegistry::load("/definitely/not/here").unwrap();
        assert!(registry.names().is_empty());
    }
}
