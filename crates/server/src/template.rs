//! Template registry.
//!
//! Templates are named parameter bundles stored as TOML files in a
//! configured directory. The registry polls the directory's most-recent
//! mtime at most once every five minutes; when it advances, the map is
//! rebuilt under a single writer lock and readers keep working against
//! the previous snapshot until the swap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::spec::ImageSpec;

/// Minimum interval between directory mtime polls.
const POLL_INTERVAL: Duration = Duration::from_secs(300);

/// A named bundle of default ImageSpec values plus delivery options.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    /// Default transformation attributes merged into requests.
    pub spec: ImageSpec,
    /// HTTP cache-control lifetime override.
    pub expiry_secs: Option<i64>,
    /// Serve with a download disposition.
    pub attachment: bool,
    /// Record statistics for requests using this template.
    pub record_stats: bool,
}

/// On-disk template file layout.
#[derive(Debug, Deserialize, Default)]
struct TemplateFile {
    /// Image parameters, keyed by the request parameter names.
    #[serde(default)]
    image: HashMap<String, toml::Value>,
    #[serde(default)]
    delivery: DeliverySection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DeliverySection {
    expiry_secs: Option<i64>,
    attachment: bool,
    record_stats: bool,
}

impl Default for DeliverySection {
    fn default() -> Self {
        DeliverySection {
            expiry_secs: None,
            attachment: false,
            record_stats: true,
        }
    }
}

struct RegistryState {
    templates: Arc<HashMap<String, Arc<Template>>>,
    last_poll: Instant,
    last_mtime: Option<SystemTime>,
}

/// Hot-reloading registry of image templates.
pub struct TemplateRegistry {
    dir: PathBuf,
    state: RwLock<RegistryState>,
}

impl TemplateRegistry {
    /// Load all templates from a directory. A missing directory is an
    /// empty registry, not an error.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let last_mtime = dir_mtime(&dir);
        let templates = load_dir(&dir)?;
        info!(dir = %dir.display(), count = templates.len(), "templates loaded");

        Ok(Self {
            dir,
            state: RwLock::new(RegistryState {
                templates: Arc::new(templates),
                last_poll: Instant::now(),
                last_mtime,
            }),
        })
    }

    /// Look up a template by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.maybe_reload();
        self.state.read().templates.get(&name.to_lowercase()).cloned()
    }

    /// Names of all known templates.
    pub fn names(&self) -> Vec<String> {
        self.maybe_reload();
        let mut names: Vec<String> = self.state.read().templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-scan the directory when the poll interval has elapsed and the
    /// directory mtime has advanced.
    fn maybe_reload(&self) {
        {
            let state = self.state.read();
            if state.last_poll.elapsed() < POLL_INTERVAL {
                return;
            }
        }

        let mut state = self.state.write();
        // Double-check under the write lock; another thread may have
        // polled while we waited.
        if state.last_poll.elapsed() < POLL_INTERVAL {
            return;
        }
        state.last_poll = Instant::now();

        let mtime = dir_mtime(&self.dir);
        if mtime == state.last_mtime {
            return;
        }

        match load_dir(&self.dir) {
            Ok(templates) => {
                info!(count = templates.len(), "templates reloaded");
                state.templates = Arc::new(templates);
                state.last_mtime = mtime;
            }
            Err(e) => {
                warn!(error = %e, "template reload failed, keeping previous set");
            }
        }
    }
}

/// Most recent mtime across the directory and its entries.
fn dir_mtime(dir: &Path) -> Option<SystemTime> {
    let mut latest = std::fs::metadata(dir).and_then(|m| m.modified()).ok()?;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified > latest {
                    latest = modified;
                }
            }
        }
    }
    Some(latest)
}

fn load_dir(dir: &Path) -> Result<HashMap<String, Arc<Template>>> {
    let mut templates = HashMap::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(templates),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let name = stem.to_lowercase();

        match load_file(&path, &name) {
            Ok(template) => {
                debug!(template = %name, "template parsed");
                templates.insert(name, Arc::new(template));
            }
            Err(e) => {
                warn!(template = %name, error = %e, "skipping unparseable template");
            }
        }
    }

    Ok(templates)
}

fn load_file(path: &Path, name: &str) -> Result<Template> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: TemplateFile = toml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    // Template values go through the same validators as request
    // parameters, so a bad file fails here rather than per-request.
    let params: HashMap<String, String> = file
        .image
        .iter()
        .map(|(k, v)| (k.clone(), toml_value_string(v)))
        .collect();
    let spec = ImageSpec::from_template_params(&params)
        .map_err(|e| anyhow::anyhow!("invalid template value: {e}"))?;

    Ok(Template {
        name: name.to_string(),
        spec,
        expiry_secs: file.delivery.expiry_secs,
        attachment: file.delivery.attachment,
        record_stats: file.delivery.record_stats,
    })
}

fn toml_value_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        other => other.to_string(),
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn write_template(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{name}.toml")), body).unwrap();
    }

    #[test]
    fn loads_templates_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_template(
            dir.path(),
            "SmallJpeg",
            r#"
            [image]
            format = "jpg"
            width = 200
            height = 200
            strip = true

            [delivery]
            expiry_secs = 3600
            attachment = false
            "#,
        );

        let registry = TemplateRegistry::load(dir.path()).unwrap();
        let template = registry.get("smalljpeg").unwrap();
        assert_eq!(template.spec.format.as_deref(), Some("jpg"));
        assert_eq!(template.spec.width, Some(200));
        assert_eq!(template.spec.height, Some(200));
        assert_eq!(template.spec.strip, Some(true));
        assert_eq!(template.expiry_secs, Some(3600));
        assert!(!template.attachment);
        assert!(template.record_stats);

        // Lookup is case-insensitive.
        assert!(registry.get("SmallJpeg").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn bad_template_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "good", "[image]\nwidth = 100\n");
        write_template(dir.path(), "bad", "[image]\nquality = 9000\n");

        let registry = TemplateRegistry::load(dir.path()).unwrap();
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = TemplateRegistry::load("/definitely/not/here").unwrap();
        assert!(registry.names().is_empty());
    }
}
