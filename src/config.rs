use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, UnsubscribeError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
}

/// Controls the inbox scan that feeds sender aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_period_days")]
    pub period_days: u32,
    /// Hard cap on messages considered in one aggregation pass
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_days: default_period_days(),
            max_messages: default_max_messages(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

/// Controls resolution and automatic execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    /// Subject line of the generated unsubscribe mail
    #[serde(default = "default_mail_subject")]
    pub mail_subject: String,
    /// Plain-text body of the generated unsubscribe mail
    #[serde(default = "default_mail_body")]
    pub mail_body: String,
    /// Upper bound on retries for transient API failures (rate limits, 5xx)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How many senders are resolved at once during the automatic phase
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,
}

impl Default for UnsubscribeConfig {
    fn default() -> Self {
        Self {
            mail_subject: default_mail_subject(),
            mail_body: default_mail_body(),
            max_retries: default_max_retries(),
            resolve_concurrency: default_resolve_concurrency(),
        }
    }
}

/// Post-unsubscribe batch actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Trash every message from the selected senders after the run
    #[serde(default = "default_delete_after")]
    pub delete_after: bool,
    /// Create a block filter for every selected sender after the run
    #[serde(default)]
    pub block_after: bool,
    /// Abort the run when a block-filter creation fails instead of
    /// logging and moving on
    #[serde(default)]
    pub halt_on_block_failure: bool,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            delete_after: default_delete_after(),
            block_after: false,
            halt_on_block_failure: false,
        }
    }
}

fn default_period_days() -> u32 {
    180
}

fn default_max_messages() -> usize {
    2000
}

fn default_max_concurrent() -> usize {
    10
}

fn default_mail_subject() -> String {
    "unsubscribe".to_string()
}

fn default_mail_body() -> String {
    "Please remove this address from your mailing list.".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_resolve_concurrency() -> usize {
    4
}

fn default_delete_after() -> bool {
    true
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            UnsubscribeError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            UnsubscribeError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        // Validate the loaded config
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                UnsubscribeError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            UnsubscribeError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            UnsubscribeError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate scan config - period_days must be 1-730
        if self.scan.period_days == 0 {
            return Err(UnsubscribeError::ConfigError(
                "scan.period_days must be at least 1".to_string(),
            ));
        }
        if self.scan.period_days > 730 {
            return Err(UnsubscribeError::ConfigError(
                "scan.period_days cannot exceed 730 (2 years)".to_string(),
            ));
        }

        if self.scan.max_messages == 0 {
            return Err(UnsubscribeError::ConfigError(
                "scan.max_messages must be at least 1".to_string(),
            ));
        }
        if self.scan.max_messages > 20_000 {
            return Err(UnsubscribeError::ConfigError(
                "scan.max_messages cannot exceed 20000".to_string(),
            ));
        }

        // Validate max_concurrent_requests - must be 1-50 to stay under rate limits
        if self.scan.max_concurrent_requests == 0 {
            return Err(UnsubscribeError::ConfigError(
                "scan.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.scan.max_concurrent_requests > 50 {
            return Err(UnsubscribeError::ConfigError(
                "scan.max_concurrent_requests cannot exceed 50 (to stay under Gmail API rate limits of 250 units/sec)".to_string(),
            ));
        }

        // Validate unsubscribe config
        if self.unsubscribe.mail_subject.trim().is_empty() {
            return Err(UnsubscribeError::ConfigError(
                "unsubscribe.mail_subject cannot be empty".to_string(),
            ));
        }

        if self.unsubscribe.max_retries == 0 {
            return Err(UnsubscribeError::ConfigError(
                "unsubscribe.max_retries must be at least 1".to_string(),
            ));
        }
        if self.unsubscribe.max_retries > 20 {
            return Err(UnsubscribeError::ConfigError(
                "unsubscribe.max_retries cannot exceed 20".to_string(),
            ));
        }

        if self.unsubscribe.resolve_concurrency == 0 {
            return Err(UnsubscribeError::ConfigError(
                "unsubscribe.resolve_concurrency must be at least 1".to_string(),
            ));
        }
        if self.unsubscribe.resolve_concurrency > 16 {
            return Err(UnsubscribeError::ConfigError(
                "unsubscribe.resolve_concurrency cannot exceed 16".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
