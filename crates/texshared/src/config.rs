//! Daemon configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables. The binary applies command-line flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::liveness::MAX_PROCESSES;
use crate::registry::MAX_IMAGES;

/// Default location of the command segment.
pub const DEFAULT_CHANNEL_PATH: &str = "/dev/shm/texshare.cmd";

/// Environment variable overriding [`DaemonConfig::channel_path`].
pub const CHANNEL_ENV: &str = "TEXSHARE_CHANNEL";

/// Configuration for the dispatcher.
///
/// # Example
///
/// ```toml
/// channel_path = "/dev/shm/texshare.cmd"
/// wait_interval_ms = 100
/// sweep_interval_ms = 1000
/// max_processes = 256
/// max_images = 256
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Path of the shared-memory command segment.
    pub channel_path: PathBuf,

    /// Bounded wait for the next command, in milliseconds.
    pub wait_interval_ms: u64,

    /// Maximum age of the last liveness sweep before one is forced after a
    /// command, in milliseconds.
    pub sweep_interval_ms: u64,

    pub max_processes: usize,

    pub max_images: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel_path: PathBuf::from(DEFAULT_CHANNEL_PATH),
            wait_interval_ms: 100,
            sweep_interval_ms: 1000,
            max_processes: MAX_PROCESSES,
            max_images: MAX_IMAGES,
        }
    }
}

impl DaemonConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    /// Loads defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    /// Applies environment overrides read through `lookup`.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(CHANNEL_ENV).filter(|p| !p.is_empty()) {
            self.channel_path = PathBuf::from(path);
        }
        self
    }

    /// Checks that every interval and limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_interval_ms == 0 {
            return Err(ConfigError::Invalid("wait_interval_ms must be positive".into()));
        }
        if self.max_processes == 0 || self.max_images == 0 {
            return Err(ConfigError::Invalid(
                "max_processes and max_images must be positive".into(),
            ));
        }
        if self.channel_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("channel_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.channel_path, PathBuf::from("/dev/shm/texshare.cmd"));
        assert_eq!(config.wait_interval(), Duration::from_millis(100));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.max_processes, 256);
        assert_eq!(config.max_images, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml("max_images = 4\nwait_interval_ms = 20\n").unwrap();
        assert_eq!(config.max_images, 4);
        assert_eq!(config.wait_interval_ms, 20);
        assert_eq!(config.max_processes, MAX_PROCESSES);
    }

    #[test]
    fn test_unknown_and_invalid_keys_rejected() {
        assert!(matches!(
            DaemonConfig::from_toml("socket = \"/tmp/x\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            DaemonConfig::from_toml("wait_interval_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_overrides_channel_path() {
        let config = DaemonConfig::default().with_env(|key| {
            (key == CHANNEL_ENV).then(|| "/tmp/custom.cmd".to_string())
        });
        assert_eq!(config.channel_path, PathBuf::from("/tmp/custom.cmd"));

        let unchanged = DaemonConfig::default().with_env(|_| Some(String::new()));
        assert_eq!(unchanged.channel_path, PathBuf::from(DEFAULT_CHANNEL_PATH));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channel_path = \"/tmp/t.cmd\"").unwrap();
        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.channel_path, PathBuf::from("/tmp/t.cmd"));

        assert!(matches!(
            DaemonConfig::from_file("/nonexistent/texshare.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
