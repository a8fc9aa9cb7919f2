//! Persisted CLI defaults
//!
//! Stores the default project, zone and token file in
//! ~/.iap-tunnel/config.json so they need not be repeated on every run.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Defaults applied when the matching flag is absent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

impl fmt::Display for TunnelDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unset = "(unset)".to_string();
        writeln!(f, "project    = {}", self.project.as_ref().unwrap_or(&unset))?;
        writeln!(f, "zone       = {}", self.zone.as_ref().unwrap_or(&unset))?;
        write!(
            f,
            "token_file = {}",
            self.token_file
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or(unset)
        )
    }
}

/// Settable keys of the defaults file
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigKey {
    Project,
    Zone,
    TokenFile,
}

/// Reads and writes the defaults file
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for the file in the user's home directory
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::with_path(home.join(".iap-tunnel").join("config.json")))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the defaults, or empty defaults when the file does not exist
    pub fn load(&self) -> Result<TunnelDefaults> {
        if !self.path.exists() {
            return Ok(TunnelDefaults::default());
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file: {:?}", self.path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", self.path))
    }

    pub fn save(&self, defaults: &TunnelDefaults) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(defaults).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write config file: {:?}", self.path))
    }

    pub fn set(&self, key: ConfigKey, value: String) -> Result<()> {
        let mut defaults = self.load()?;
        match key {
            ConfigKey::Project => defaults.project = Some(value),
            ConfigKey::Zone => defaults.zone = Some(value),
            ConfigKey::TokenFile => defaults.token_file = Some(PathBuf::from(value)),
        }
        self.save(&defaults)
    }

    /// Clear one key, or every key when `key` is `None`
    pub fn clear(&self, key: Option<ConfigKey>) -> Result<()> {
        let mut defaults = self.load()?;
        match key {
            Some(ConfigKey::Project) => defaults.project = None,
            Some(ConfigKey::Zone) => defaults.zone = None,
            Some(ConfigKey::TokenFile) => defaults.token_file = None,
            None => defaults = TunnelDefaults::default(),
        }
        self.save(&defaults)
    }
}
