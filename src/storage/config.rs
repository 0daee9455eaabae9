//! Configuration handling for vecedit
//!
//! Configuration is stored in `~/.config/vecedit/config.toml` (or the
//! platform equivalent). `VECEDIT_CONFIG` or `--config` point elsewhere.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::FieldNamePolicy;
use crate::edit::{EditOptions, RepackPolicy, WindingPolicy};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "VECEDIT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Editing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditingConfig {
    /// Spatial reference for new layers when none is given
    pub default_srs: String,

    /// Handling of field names longer than ten characters
    pub field_names: FieldNamePolicy,

    /// Handling of counter-clockwise polygon exteriors
    pub winding: WindingPolicy,

    /// When file-backed layers are repacked
    pub repack: RepackPolicy,

    /// Coordinate comparison tolerance
    pub coordinate_epsilon: f64,
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            default_srs: "EPSG:4326".to_string(),
            field_names: FieldNamePolicy::Truncate,
            winding: WindingPolicy::Reverse,
            repack: RepackPolicy::OnSync,
            coordinate_epsilon: 1e-9,
        }
    }
}

impl EditingConfig {
    /// Builds the options consumed by edit sessions
    pub fn options(&self) -> EditOptions {
        EditOptions {
            field_names: self.field_names,
            winding: self.winding,
            repack: self.repack,
            epsilon: self.coordinate_epsilon,
        }
    }
}

/// Output format for commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub editing: EditingConfig,

    pub output: OutputConfig,

    /// Layer category -> style token
    pub styles: HashMap<String, String>,

    /// File this configuration was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from `explicit`, then `VECEDIT_CONFIG`, then the
    /// default location. A missing file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(Self::default_path);

        match path {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) if explicit.is_some() => {
                anyhow::bail!("Config file not found: {}", path.display())
            }
            _ => Ok(Self::default()),
        }
    }

    /// Loads configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Returns the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "vecedit", "vecedit")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let eps = self.editing.coordinate_epsilon;
        if !eps.is_finite() || eps < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "coordinate_epsilon must be a non-negative number, got {}",
                eps
            )));
        }
        if self.editing.default_srs.trim().is_empty() {
            return Err(ConfigError::Invalid("default_srs must not be empty".into()));
        }
        Ok(())
    }

    /// Saves the configuration
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }
}
