//! Configuration management for Chorale
//!
//! This module provides:
//! - The `ChoraleConfig` tree (usage policy, capture tuning, mixer, devices)
//! - TOML load/save with a factory default
//! - Hot-reload support via file system watcher

use crate::domain::admin::{
    Behavior, BehaviorGain, CaptureUsage, InteractionRule, RenderUsage, Usage,
};
use crate::domain::capturer::CaptureTuning;
use crate::domain::gain::{MAX_GAIN_DB, MIN_GAIN_DB};
use crate::domain::mixer::MixerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Usage interaction policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Gain applied for each behavior
    pub behavior_gain: BehaviorGain,
    pub rules: Vec<InteractionRule>,
}

/// Device persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Directory for per-device settings (None = next to the config file)
    pub settings_path: Option<PathBuf>,
}

/// Complete Chorale configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoraleConfig {
    pub policy: PolicyConfig,
    pub capture: CaptureTuning,
    pub mixer: MixerSettings,
    pub devices: DevicesConfig,
}

impl ChoraleConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(rules = config.policy.rules.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capture.max_time_per_capture_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture.max_time_per_capture_ms must be positive".to_string(),
            ));
        }
        if self.capture.partial_overflow_frac_frames < 0 {
            return Err(ConfigError::Invalid(
                "capture.partial_overflow_frac_frames must not be negative".to_string(),
            ));
        }
        let threshold = self.mixer.linear_ratio_threshold;
        if threshold.is_nan() || threshold < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "mixer.linear_ratio_threshold {threshold} is below 1.0"
            )));
        }

        let gains = &self.policy.behavior_gain;
        for (name, db) in [
            ("none", gains.none_gain_db),
            ("duck", gains.duck_gain_db),
            ("mute", gains.mute_gain_db),
        ] {
            if db.is_nan() || !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&db) {
                return Err(ConfigError::Invalid(format!(
                    "policy.behavior_gain.{name}_gain_db {db} is out of range"
                )));
            }
        }
        for rule in &self.policy.rules {
            if rule.active == rule.affected {
                return Err(ConfigError::Invalid(format!(
                    "interaction rule for {} affects itself",
                    rule.active
                )));
            }
        }
        Ok(())
    }

    /// Create factory default configuration
    pub fn factory_default() -> Self {
        let mut config = Self::default();

        // Communication ducks media and background, whether it plays or records.
        let communication = [
            Usage::Render(RenderUsage::Communication),
            Usage::Capture(CaptureUsage::Communication),
        ];
        for active in communication {
            for affected in [
                Usage::Render(RenderUsage::Media),
                Usage::Render(RenderUsage::Background),
            ] {
                config.policy.rules.push(InteractionRule {
                    active,
                    affected,
                    behavior: Behavior::Duck,
                });
            }
        }

        config.policy.rules.push(InteractionRule {
            active: Usage::Capture(CaptureUsage::SystemAgent),
            affected: Usage::Render(RenderUsage::Background),
            behavior: Behavior::Mute,
        });

        config
    }
}

/// File system watcher for hot-reload
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    config_tx: broadcast::Sender<PathBuf>,
}

impl ConfigWatcher {
    /// Watch `config_dir` for created or modified `.toml` files
    pub async fn new(config_dir: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let (config_tx, _config_rx) = broadcast::channel(32);

        fs::create_dir_all(&config_dir).await?;

        let tx_clone = config_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in event.paths {
                        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                            // No subscriber is fine; the app may not listen yet.
                            if tx_clone.send(path).is_err() {
                                debug!("Config change with no subscribers");
                            }
                        }
                    }
                }
            }
        })?;

        watcher.watch(&config_dir, notify::RecursiveMode::NonRecursive)?;

        info!(
            path = %config_dir.display(),
            "Config watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            config_tx,
        })
    }

    /// Subscribe to config change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.config_tx.subscribe()
    }
}

/// Configuration manager for the main Chorale config
///
/// Manages the main configuration file at `~/.config/chorale/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/chorale` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("chorale"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory for per-device settings
    pub fn device_settings_dir(&self, config: &ChoraleConfig) -> PathBuf {
        config
            .devices
            .settings_path
            .clone()
            .unwrap_or_else(|| self.config_dir.join("devices"))
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns the factory default.
    /// If the config file is corrupt, backs it up and returns the factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> ChoraleConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = ChoraleConfig::factory_default();

            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match ChoraleConfig::load_from_file(&self.config_path).await {
            Ok(config) => {
                info!(
                    path = %self.config_path.display(),
                    "Configuration loaded successfully"
                );
                config
            }
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                ChoraleConfig::factory_default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &ChoraleConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;

        config.save_to_file(&self.config_path).await
    }

    /// Clear configuration (delete config file)
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(
                path = %self.config_path.display(),
                "Configuration cleared"
            );
        }

        Ok(())
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
