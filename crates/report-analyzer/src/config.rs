// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_WINDOW_SECS: u64 = 60 * 60;
const DEFAULT_GRACE_SECS: u64 = 3 * 60;
const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 60;
const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STORAGE_DIR: &str = "./data";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the analyzers and of the driver feeding them.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    /// Length of one report window
    pub window: Duration,
    /// Extra time after the window end during which late messages are accepted
    pub grace: Duration,
    /// How often the driver checkpoints live reports
    pub checkpoint_interval: Duration,
    /// Upper bound for any single storage call
    pub storage_timeout: Duration,
    /// Root directory of the filesystem storage
    pub storage_dir: PathBuf,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            grace: Duration::from_secs(DEFAULT_GRACE_SECS),
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS),
            storage_timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            log_level: "info".to_string(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl AnalyzerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let window = parse_env("REPORT_WINDOW_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.window);
        let grace = parse_env("REPORT_GRACE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace);
        let checkpoint_interval = parse_env("REPORT_CHECKPOINT_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.checkpoint_interval);
        let storage_timeout = parse_env("REPORT_STORAGE_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.storage_timeout);
        let storage_dir = env::var("REPORT_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_dir);
        let log_level = env::var("REPORT_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            window,
            grace,
            checkpoint_interval,
            storage_timeout,
            storage_dir,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Invalid(
                "REPORT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "REPORT_CHECKPOINT_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.storage_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "REPORT_STORAGE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "REPORT_STORAGE_DIR cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 6] = [
        "REPORT_WINDOW_SECS",
        "REPORT_GRACE_SECS",
        "REPORT_CHECKPOINT_INTERVAL_SECS",
        "REPORT_STORAGE_TIMEOUT_MS",
        "REPORT_STORAGE_DIR",
        "REPORT_LOG_LEVEL",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AnalyzerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_durations() {
        let config = AnalyzerConfig {
            window: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalyzerConfig {
            checkpoint_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalyzerConfig {
            storage_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // A window without grace period is fine.
        let config = AnalyzerConfig {
            grace: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AnalyzerConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = AnalyzerConfig::from_env().expect("defaults should be valid");
        assert_eq!(config, AnalyzerConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("REPORT_WINDOW_SECS", "600");
        env::set_var("REPORT_GRACE_SECS", "30");
        env::set_var("REPORT_STORAGE_TIMEOUT_MS", "250");
        env::set_var("REPORT_STORAGE_DIR", "/var/lib/reports");
        env::set_var("REPORT_LOG_LEVEL", "DEBUG");

        let config = AnalyzerConfig::from_env().expect("overrides should be valid");
        assert_eq!(config.window, Duration::from_secs(600));
        assert_eq!(config.grace, Duration::from_secs(30));
        assert_eq!(config.storage_timeout, Duration::from_millis(250));
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/reports"));
        assert_eq!(config.log_level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_window() {
        clear_env();
        env::set_var("REPORT_WINDOW_SECS", "0");
        assert!(AnalyzerConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_unparsable_values() {
        clear_env();
        env::set_var("REPORT_CHECKPOINT_INTERVAL_SECS", "soon");
        let config = AnalyzerConfig::from_env().expect("bad values fall back to defaults");
        assert_eq!(
            config.checkpoint_interval,
            Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS)
        );
        clear_env();
    }
}
