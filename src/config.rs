use anyhow::{Context, Result, bail};
use reconcile::{ParsedConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::paths;

// ============================================================================
// Settings (converge.toml)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub plan: PlanSettings,
    pub lock: LockSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanSettings {
    pub redact_secrets: bool,
    pub compute_diffs: bool,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            redact_secrets: true,
            compute_diffs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    /// Attempts before giving up on a held lock
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Age after which a lock counts as abandoned
    pub stale_after_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            stale_after_secs: 300,
        }
    }
}

impl LockSettings {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Settings {
    /// Load `<workdir>/converge.toml`, or defaults when it does not exist.
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = workdir.join(paths::SETTINGS_FILE);
        if !path.exists() {
            log::debug!("No {} in {}, using defaults", paths::SETTINGS_FILE, workdir.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }
}

// ============================================================================
// Desired configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Parse one configuration document.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<ParsedConfig> {
    match format {
        ConfigFormat::Json => serde_json::from_str(content).context("Invalid JSON configuration"),
        ConfigFormat::Toml => toml::from_str(content).context("Invalid TOML configuration"),
    }
}

/// Load and merge configuration files in order, then validate the result.
pub fn load_configs(files: &[impl AsRef<Path>]) -> Result<ParsedConfig> {
    let mut merged = ParsedConfig::default();
    for file in files {
        let file = file.as_ref();
        let Some(format) = ConfigFormat::from_path(file) else {
            bail!("{} must be a .json or .toml file", file.display());
        };
        let content = fs::read_to_string(file)
            .with_context(|| format!("Could not read {}", file.display()))?;
        let config = parse_config(&content, format)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        log::debug!("Loaded {} resources from {}", config.len(), file.display());
        merged
            .merge(config)
            .with_context(|| format!("Failed to merge {}", file.display()))?;
    }
    merged.validate()?;
    Ok(merged)
}
