use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::throttle::{ThrottleConfig, validate_thresholds};
use crate::{Error, Result};

pub const CONFIG_ENV_VAR: &str = "PARSYNC_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub throttle: ThrottleSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Unset means one less than the number of cores.
    #[serde(default)]
    pub max_procs: Option<usize>,
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_suspend_threshold")]
    pub suspend_threshold: f32,
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: f32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_suspend_threshold() -> f32 {
    80.0
}

fn default_resume_threshold() -> f32 {
    60.0
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            suspend_threshold: default_suspend_threshold(),
            resume_threshold: default_resume_threshold(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ThrottleSettings {
    pub fn to_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            suspend_threshold: self.suspend_threshold,
            resume_threshold: self.resume_threshold,
            interval: Duration::from_millis(self.interval_ms),
        }
    }
}

impl ProgressSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_procs == Some(0) {
            return Err(Error::InvalidConfig {
                message: "transfer.max_procs must be >= 1".to_string(),
            });
        }
        if self.progress.interval_ms == 0 {
            return Err(Error::InvalidConfig {
                message: "progress.interval_ms must be > 0".to_string(),
            });
        }
        if self.throttle.interval_ms == 0 {
            return Err(Error::InvalidConfig {
                message: "throttle.interval_ms must be > 0".to_string(),
            });
        }
        // Thresholds are inert until throttling is switched on.
        if self.throttle.enabled {
            validate_thresholds(self.throttle.suspend_threshold, self.throttle.resume_threshold)?;
        }
        Ok(())
    }

    pub fn max_procs(&self) -> usize {
        self.transfer.max_procs.unwrap_or_else(default_max_procs)
    }
}

/// One less than the available cores, leaving room for the driver itself; never below 1.
pub fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// `--config` wins over the environment; neither means no settings file.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_config_path_from(explicit, std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
}

fn resolve_config_path_from(explicit: Option<&Path>, env: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or(env.filter(|p| !p.as_os_str().is_empty()))
}

/// Reads and validates a settings file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(path).map_err(|e| Error::Settings {
        path: path.to_path_buf(),
        message: format!("read failed: {e}"),
    })?;
    let settings = parse_settings(&text).map_err(|e| Error::Settings {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    settings.validate()?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    toml::from_str(text)
}
