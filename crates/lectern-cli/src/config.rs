//! Persistent CLI configuration.
//!
//! Stored as JSON under the platform config directory. Environment
//! variables override file values; the access token is only ever read from
//! the environment and never written to disk.

use std::path::{Path, PathBuf};

use lectern_core::sync::policy_from_name;
use lectern_core::util::{is_http_url, normalize_text_option};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "config.json";
const DEFAULT_OWNER_ID: &str = "local";
const DEFAULT_POLICY: &str = "last-write-wins";

pub const ENV_API_URL: &str = "LECTERN_API_URL";
pub const ENV_TOKEN: &str = "LECTERN_TOKEN";
pub const ENV_OWNER_ID: &str = "LECTERN_OWNER_ID";
pub const ENV_DB_PATH: &str = "LECTERN_DB_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub conflict_policy: Option<String>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Everything a sync session needs, resolved from file and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub token: String,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> Result<PathBuf, CliError> {
    dirs::config_dir()
        .map(|dir| dir.join("lectern").join(CONFIG_FILE_NAME))
        .ok_or_else(|| CliError::Config("Failed to resolve config directory".into()))
}

pub fn normalize_api_url(value: String) -> Result<String, CliError> {
    let value = value.trim().trim_end_matches('/').to_string();
    if is_http_url(&value) {
        Ok(value)
    } else {
        Err(CliError::Config(format!(
            "API URL must start with http:// or https:// (got '{value}')"
        )))
    }
}

pub fn normalize_policy(value: String) -> Result<String, CliError> {
    policy_from_name(&value)
        .map(|policy| policy.name().to_string())
        .ok_or_else(|| {
            CliError::Config(format!(
                "Unknown conflict policy '{}'; expected last-write-wins or manual",
                value.trim()
            ))
        })
}

impl CliConfig {
    pub fn load() -> Result<Self, CliError> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            CliError::Config(format!("Failed to read config at {}: {error}", path.display()))
        })?;
        let mut config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            CliError::Config(format!("Failed to parse config at {}: {error}", path.display()))
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                CliError::Config(format!(
                    "Failed to create config directory {}: {error}",
                    parent.display()
                ))
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)?;
        std::fs::write(path, serialized).map_err(|error| {
            CliError::Config(format!("Failed to write config at {}: {error}", path.display()))
        })
    }

    /// Apply `LECTERN_*` overrides read through `lookup`.
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(api_url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_base_url = Some(api_url);
        }
        if let Some(owner_id) = normalize_text_option(lookup(ENV_OWNER_ID)) {
            self.owner_id = Some(owner_id);
        }
        if let Some(db_path) = normalize_text_option(lookup(ENV_DB_PATH)) {
            self.db_path = Some(PathBuf::from(db_path));
        }
        self
    }

    /// File config with the process environment applied.
    pub fn effective() -> Result<Self, CliError> {
        Ok(Self::load()?.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn owner_id(&self) -> &str {
        self.owner_id.as_deref().unwrap_or(DEFAULT_OWNER_ID)
    }

    pub fn policy_name(&self) -> &str {
        self.conflict_policy.as_deref().unwrap_or(DEFAULT_POLICY)
    }

    /// Remote URL plus token, or `SyncNotConfigured` if either is missing.
    pub fn sync_settings(&self, token: Option<String>) -> Result<SyncSettings, CliError> {
        let Some(api_base_url) = self.api_base_url.clone() else {
            return Err(CliError::SyncNotConfigured);
        };
        let Some(token) = normalize_text_option(token) else {
            return Err(CliError::SyncNotConfigured);
        };
        Ok(SyncSettings {
            api_base_url: normalize_api_url(api_base_url)?,
            token,
        })
    }

    fn normalize(&mut self) {
        self.api_base_url = normalize_text_option(self.api_base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.owner_id = normalize_text_option(self.owner_id.take());
        self.conflict_policy = normalize_text_option(self.conflict_policy.take());
        if self.version == 0 {
            self.version = default_config_version();
        }
    }
}
