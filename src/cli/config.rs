use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::FailurePolicy;
use crate::fill::DEFAULT_DAY_INTERVAL_MINUTES;

pub const CONFIG_FILENAME: &str = ".sensorchart.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub http_host: String,
    pub api_version: String,
    /// Websocket of the push bridge. Live updates are off without it.
    #[serde(default)]
    pub push_url: Option<String>,
    #[serde(default = "default_day_interval")]
    pub day_interval_minutes: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_day_interval() -> u32 {
    DEFAULT_DAY_INTERVAL_MINUTES
}

impl Config {
    /// Load `.sensorchart.toml` from the working directory, then from the home
    /// directory.
    pub fn load() -> Result<Self> {
        let local = Path::new(CONFIG_FILENAME);
        if local.exists() {
            return load_config_from_path(local);
        }
        match home_config_path() {
            Some(path) if path.exists() => load_config_from_path(path),
            _ => anyhow::bail!(
                "{} not found in the current directory or the home directory",
                CONFIG_FILENAME
            ),
        }
    }

    /// Validate every field that has a restricted value set.
    pub fn validate(&self) -> Result<()> {
        validate_api_version(&self.api_version)?;
        if !(1..=60).contains(&self.day_interval_minutes) {
            anyhow::bail!(
                "day_interval_minutes must be between 1 and 60, got {}",
                self.day_interval_minutes
            );
        }
        Ok(())
    }
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILENAME))
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    config.validate()?;
    Ok(config)
}

pub fn try_load_config() -> Option<Config> {
    Config::load().ok()
}

/// API versions look like `v1.0`, `v1.1`.
pub fn validate_api_version(version: &str) -> Result<&str> {
    let valid = version
        .strip_prefix('v')
        .and_then(|rest| rest.split_once('.'))
        .is_some_and(|(major, minor)| {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        });
    if !valid {
        anyhow::bail!("API version '{}' is not of the form v<major>.<minor>", version);
    }
    Ok(version)
}
