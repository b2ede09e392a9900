//! Configuration management.
//!
//! Holds the upstream identity provider location, the retry policy for each
//! operation kind, and credential vault settings.
//!
//! Configuration is stored at `~/.config/tenantdash/config.json`. Missing
//! files and missing fields fall back to defaults; a few environment
//! variables override the file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::RetryPolicy;

/// Application name used for config directory paths
const APP_NAME: &str = "tenantdash";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_BASE_URL: &str = "TENANTDASH_BASE_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "TENANTDASH_REQUEST_TIMEOUT_SECS";

/// HTTP request timeout in seconds, applied per attempt.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub login_path: String,
    pub profile_path: String,
    pub register_path: String,
    pub health_path: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8009".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            login_path: "/auth/login".to_string(),
            profile_path: "/auth/profile".to_string(),
            register_path: "/auth/register".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub query: RetryPolicy,
    pub mutation: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            query: RetryPolicy::query_default(),
            mutation: RetryPolicy::mutation_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Persist the credential in the OS keychain between runs
    pub enabled: bool,
    pub service_name: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: APP_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, returning defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.upstream.base_url = base_url.trim().to_string();
        }
        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            self.upstream.request_timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", ENV_REQUEST_TIMEOUT))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            bail!("upstream.base_url must not be empty");
        }
        if self.upstream.request_timeout_secs == 0 {
            bail!("upstream.request_timeout_secs must be greater than zero");
        }
        if self.retry.query.max_attempts == 0 || self.retry.mutation.max_attempts == 0 {
            bail!("retry max_attempts must be at least 1");
        }
        Ok(())
    }
}
