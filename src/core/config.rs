//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::{RetryPolicy, MAX_RETRY_ATTEMPTS};
use super::models::QualityPreference;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Main application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub extraction: ExtractionConfig,
    pub fetch: FetchConfig,
    pub mux: MuxConfig,
    pub rendering: RenderingConfig,
    pub logging: LoggingConfig,
}

/// Job-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_directory: String,
    pub user_agent: String,
    pub quality: QualityPreference,
    pub max_concurrent_jobs: usize,
    /// How often a fetching job checkpoints its byte counts
    pub persist_interval_ms: u64,
    pub rate_limit_bytes_per_sec: Option<u64>,
}

/// Page loading and parsing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub page_timeout_seconds: u64,
}

/// Stream transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub connect_timeout_seconds: u64,
    /// A body read idle longer than this counts as a timeout
    pub read_timeout_seconds: u64,
    pub progress_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
}

/// External muxing tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MuxConfig {
    pub ffmpeg_path: String,
    pub timeout_seconds: u64,
}

/// Headless browser used for pages that build their player with script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderingConfig {
    pub browser_binary: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            extraction: ExtractionConfig::default(),
            fetch: FetchConfig::default(),
            mux: MuxConfig::default(),
            rendering: RenderingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_directory: "downloads".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            quality: QualityPreference::Best,
            max_concurrent_jobs: 3,
            persist_interval_ms: 2000,
            rate_limit_bytes_per_sec: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            page_timeout_seconds: 180,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 30_000,
            connect_timeout_seconds: 15,
            read_timeout_seconds: 180,
            progress_interval_ms: 500,
            cancel_poll_interval_ms: 250,
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            timeout_seconds: 600,
        }
    }
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            browser_binary: None,
            timeout_seconds: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ExtractionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_base_delay_ms.saturating_mul(8)),
        )
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_seconds)
    }
}

impl RenderingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl DownloadConfig {
    /// Destination used when a caller does not name one
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_directory)
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            let config = Self::load_from(&config_path)?;
            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save()?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load and validate, falling back to defaults on any problem
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(cfg) => match cfg.validate() {
                Ok(()) => cfg,
                Err(err) => {
                    tracing::warn!(
                        "Invalid configuration detected ({}), falling back to defaults",
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(
                    "Failed to load configuration from disk: {}. Using defaults",
                    err
                );
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&content).with_context(|| "Failed to parse config file")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)?;
        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "multisite", "video-downloader")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Parse and validate configuration from a JSON string without persisting it
    pub fn import(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).with_context(|| "Failed to parse imported configuration")?;

        config
            .validate()
            .with_context(|| "Imported configuration is invalid")?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_jobs == 0 {
            anyhow::bail!("Concurrent jobs must be greater than 0");
        }

        if self.download.max_concurrent_jobs > 20 {
            anyhow::bail!("Concurrent jobs should not exceed 20");
        }

        if self.download.user_agent.trim().is_empty() {
            anyhow::bail!("User agent must not be empty");
        }

        if let Some(limit) = self.download.rate_limit_bytes_per_sec {
            if limit < 1024 {
                anyhow::bail!("Rate limit should be at least 1024 bytes per second");
            }
        }

        for (name, attempts) in [
            ("Extraction", self.extraction.max_attempts),
            ("Fetch", self.fetch.max_attempts),
        ] {
            if attempts == 0 || attempts > MAX_RETRY_ATTEMPTS {
                anyhow::bail!(
                    "{} attempts should be between 1 and {}",
                    name,
                    MAX_RETRY_ATTEMPTS
                );
            }
        }

        if self.extraction.page_timeout_seconds == 0 || self.extraction.page_timeout_seconds > 300
        {
            anyhow::bail!("Page timeout should be between 1 and 300 seconds");
        }

        if self.rendering.timeout_seconds == 0 || self.rendering.timeout_seconds > 300 {
            anyhow::bail!("Rendering timeout should be between 1 and 300 seconds");
        }

        if self.download.output_directory.trim().is_empty() {
            anyhow::bail!("Output directory must not be empty");
        }

        if self.fetch.read_timeout_seconds == 0 || self.fetch.read_timeout_seconds > 600 {
            anyhow::bail!("Read timeout should be between 1 and 600 seconds");
        }

        if self.fetch.retry_max_delay_ms < self.fetch.retry_base_delay_ms {
            anyhow::bail!("Maximum retry delay must not be below the base delay");
        }

        if self.fetch.cancel_poll_interval_ms == 0 || self.fetch.cancel_poll_interval_ms > 5000 {
            anyhow::bail!("Cancel poll interval should be between 1 and 5000 ms");
        }

        if self.mux.ffmpeg_path.trim().is_empty() {
            anyhow::bail!("ffmpeg path must not be empty");
        }

        if self.mux.timeout_seconds == 0 {
            anyhow::bail!("Merge timeout must be greater than 0");
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}
