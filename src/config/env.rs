//! Environment variable configuration
//!
//! Provides environment variable overrides for [`EngineConfig`].

use std::env;

use super::EngineConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CIRCUS";

/// Overrides read from the environment
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Timeout in ms from CIRCUS_TIMEOUT
    pub timeout: Option<u64>,
    /// Shuffle seed from CIRCUS_SEED
    pub seed: Option<u64>,
    /// Randomize from CIRCUS_RANDOMIZE
    pub randomize: Option<bool>,
    /// Retry count from CIRCUS_RETRIES
    pub retries: Option<u32>,
    /// Concurrency limit from CIRCUS_MAX_CONCURRENCY
    pub max_concurrency: Option<usize>,
    /// Name filter from CIRCUS_TEST_NAME_PATTERN
    pub test_name_pattern: Option<String>,
    /// Log level from CIRCUS_LOG
    pub log_level: Option<String>,
    /// Config file from CIRCUS_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            timeout: get_env_parse("TIMEOUT"),
            seed: get_env_parse("SEED"),
            randomize: get_env_bool("RANDOMIZE"),
            retries: get_env_parse("RETRIES"),
            max_concurrency: get_env_parse("MAX_CONCURRENCY"),
            test_name_pattern: get_env("TEST_NAME_PATTERN"),
            log_level: get_env("LOG"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any override is set
    pub fn has_any(&self) -> bool {
        self.timeout.is_some()
            || self.seed.is_some()
            || self.randomize.is_some()
            || self.retries.is_some()
            || self.max_concurrency.is_some()
            || self.test_name_pattern.is_some()
            || self.log_level.is_some()
            || self.config_file.is_some()
    }

    /// Overlay the set variables on `config`; a seed implies randomize
    pub fn apply_to(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(timeout) = self.timeout {
            config.test_timeout_ms = timeout;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
            config.randomize = true;
        }
        if let Some(randomize) = self.randomize {
            config.randomize = randomize;
        }
        if let Some(retries) = self.retries {
            config.retry_times = retries;
        }
        if let Some(max) = self.max_concurrency {
            config.max_concurrency = max;
        }
        if let Some(pattern) = &self.test_name_pattern {
            config.test_name_pattern = Some(pattern.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn timeout(self, ms: u64) -> Self {
        self.var("TIMEOUT", ms)
    }

    pub fn seed(self, seed: u64) -> Self {
        self.var("SEED", seed)
    }

    pub fn randomize(self, randomize: bool) -> Self {
        self.var("RANDOMIZE", randomize)
    }

    pub fn retries(self, retries: u32) -> Self {
        self.var("RETRIES", retries)
    }

    pub fn test_name_pattern(self, pattern: &str) -> Self {
        self.var("TEST_NAME_PATTERN", pattern)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
