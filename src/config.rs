//! Engine configuration

use crate::error::EngineResult;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_NOTICE_TTL_MS: u64 = 3000;
const DEFAULT_MAX_REPORTED_OFFENDERS: usize = 3;

/// When single-field validation runs on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationMode {
    /// After every value change
    OnChange,
    /// When a field is marked touched
    OnBlur,
    /// Only on submit or explicit whole-form validation
    #[default]
    OnSubmit,
}

/// User configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub validation_mode: Option<ValidationMode>,
    /// Delay before transient notices clear, in milliseconds
    pub notice_ttl_ms: Option<u64>,
    /// How many offending items a refused add names
    pub max_reported_offenders: Option<usize>,
}

impl EngineConfig {
    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "schema-forms", "schema-forms")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Load configuration from file
    pub fn load() -> EngineResult<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a given file, defaults when it does not exist
    pub fn load_from(path: &std::path::Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> EngineResult<()> {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(self)?;
            fs::write(&path, content)?;
        }
        Ok(())
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode.unwrap_or_default()
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms.unwrap_or(DEFAULT_NOTICE_TTL_MS))
    }

    pub fn max_reported_offenders(&self) -> usize {
        self.max_reported_offenders
            .unwrap_or(DEFAULT_MAX_REPORTED_OFFENDERS)
    }
}
