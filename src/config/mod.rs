//! Configuration module
//!
//! Run options for the engine, loaded from YAML/JSON files and overlaid
//! with environment variables.

mod env;

pub use env::{EnvBuilder, EnvConfig, EnvGuard, ENV_PREFIX};

use crate::utils::{init_logger, LogLevel};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-local config file names, checked before the user config dir
const CONFIG_LOCATIONS: &[&str] = &["./circus.yaml", "./circus.yml", "./.circus.yaml"];

/// Engine run options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default timeout for tests and hooks without their own
    pub test_timeout_ms: u64,

    /// Shuffle each block's children
    pub randomize: bool,

    /// Shuffle seed; drawn at random when randomizing without one
    pub seed: Option<u64>,

    /// Extra attempts for a failing test
    pub retry_times: u32,

    /// Concurrent test bodies in flight at once
    pub max_concurrency: usize,

    /// Only tests whose full name matches run
    pub test_name_pattern: Option<String>,

    /// Log level for `init_logger`
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            test_timeout_ms: 5000,
            randomize: false,
            seed: None,
            retry_times: 0,
            max_concurrency: 5,
            test_name_pattern: None,
            log_level: "warn".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Shuffle sibling order with a fixed seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.randomize = true;
        self.seed = Some(seed);
        self
    }

    pub fn with_retries(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.test_name_pattern = Some(pattern.into());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    /// Parsed `log_level`, falling back to warn for unknown names
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_name(&self.log_level).unwrap_or(LogLevel::Warn)
    }

    /// Install the global subscriber at the configured level
    pub fn init_logging(&self) -> bool {
        init_logger(self.log_level())
    }

    pub fn validate(&self) -> Result<()> {
        if LogLevel::from_name(&self.log_level).is_none() {
            bail!("unknown log_level: {}", self.log_level);
        }
        if self.test_timeout_ms == 0 {
            bail!("test_timeout_ms must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        Ok(())
    }

    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .chain(dirs::config_dir().map(|dir| dir.join("circus").join("config.yaml")))
            .find(|path| path.exists())
    }

    /// Load from the first standard location, environment applied on top
    pub fn load_default() -> Result<Self> {
        let env = EnvConfig::load();
        let path = env
            .config_file
            .as_ref()
            .map(PathBuf::from)
            .or_else(Self::find);

        let config = match path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        let config = env.apply_to(config);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
