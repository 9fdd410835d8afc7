//! Per-device settings persisted as JSON files
//!
//! One file per device unique id under a settings directory. Writes go to a
//! temporary file first and are renamed into place.

use anyhow::Context;
use chorale_core::domain::audio::{AudioError, DeviceId, Result};
use chorale_core::domain::device_manager::DeviceSettingsStore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    dir: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the settings for `unique_id`
    pub fn path_for(&self, unique_id: &DeviceId) -> PathBuf {
        let name: String = unique_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn load_file(path: &Path) -> anyhow::Result<Option<serde_json::Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    fn store_file(&self, path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let contents = serde_json::to_string_pretty(value).context("serializing settings")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

impl DeviceSettingsStore for JsonFileSettingsStore {
    fn load(&self, unique_id: &DeviceId) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(unique_id);
        match Self::load_file(&path) {
            Ok(value) => {
                debug!(device = %unique_id, found = value.is_some(), "Loaded device settings");
                Ok(value)
            }
            Err(e) => {
                warn!(device = %unique_id, "Failed to load device settings: {e:#}");
                Err(AudioError::Settings(format!("{e:#}")))
            }
        }
    }

    fn store(&self, unique_id: &DeviceId, value: serde_json::Value) -> Result<()> {
        let path = self.path_for(unique_id);
        self.store_file(&path, &value)
            .map_err(|e| AudioError::Settings(format!("{e:#}")))?;
        debug!(device = %unique_id, path = %path.display(), "Stored device settings");
        Ok(())
    }
}
