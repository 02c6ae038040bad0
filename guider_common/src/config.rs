//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for every guider process: the equipment-owning server and any external
//! client tool.
//!
//! # Usage
//!
//! ```rust,no_run
//! use guider_common::config::{ConfigError, ConfigLoader, GuiderConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = GuiderConfig::load(Path::new("guider.toml"))?;
//!     config.validate()?;
//!     println!("Namespace: {}", config.shm.namespace);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_NAMESPACE, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
use crate::shm::names::ShmNames;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// configuration files.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Represents the verbosity level of logging output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all guider applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "guider-main"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: "guider".to_string(),
        }
    }
}

/// Shared memory and notification settings.
///
/// Every participating process must use the same `namespace`, otherwise the
/// derived segment and semaphore names will not line up.
///
/// # TOML Example
///
/// ```toml
/// [shm]
/// namespace = "phd2"
/// wait_timeout_ms = 1000
/// poll_interval_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Prefix of every segment and semaphore name.
    pub namespace: String,
    /// Bound on a single notification wait in milliseconds.
    pub wait_timeout_ms: u64,
    /// Interval of the multi-domain polling monitor in milliseconds.
    pub poll_interval_ms: u64,
    /// Create registries that do not exist yet (server side).
    pub create_if_missing: bool,
    /// Unlink owned segments on shutdown (server side).
    pub unlink_on_shutdown: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            create_if_missing: true,
            unlink_on_shutdown: true,
        }
    }
}

impl ShmConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `namespace` is empty or contains anything but ASCII alphanumerics and `_`
    /// - `wait_timeout_ms` or `poll_interval_ms` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !ShmNames::is_valid_namespace(&self.namespace) {
            return Err(ConfigError::ValidationError(format!(
                "invalid namespace '{}': expected [A-Za-z0-9_]+",
                self.namespace
            )));
        }
        if self.wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "wait_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Notification wait bound as a `Duration`.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Polling interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Well-known names derived from `namespace`.
    pub fn names(&self) -> ShmNames {
        ShmNames::new(&self.namespace)
    }
}

/// Top-level configuration file of a guider process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuiderConfig {
    /// Logging and identity.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Shared memory settings.
    #[serde(default)]
    pub shm: ShmConfig,
}

impl GuiderConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.shm.validate()
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed: TestWrapper = toml::from_str(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, level);
            assert_eq!(level.as_directive(), text);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_shm_config_defaults() {
        let config = ShmConfig::default();
        assert_eq!(config.namespace, "phd2");
        assert_eq!(config.wait_timeout(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.create_if_missing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shm_config_rejects_bad_namespace() {
        let mut config = ShmConfig::default();
        config.namespace = "phd2/other".to_string();
        assert!(config.validate().is_err());

        config.namespace = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shm_config_rejects_zero_timeouts() {
        let config = ShmConfig {
            wait_timeout_ms: 0,
            ..ShmConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ShmConfig {
            poll_interval_ms: 0,
            ..ShmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = GuiderConfig::load(Path::new("/nonexistent/path/guider.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = GuiderConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
