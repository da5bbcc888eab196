//! Controller configuration
//!
//! Every field has a default, so an empty TOML document is a valid configuration.

use crate::capture::FrameTiming;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to parse config file {}: {source}", path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// OS-level name of the control channel segment. Only the default name can be combined
    /// with `payload_path`.
    #[serde(default = "default_channel_name")]
    pub channel_name: String,
    /// Payload module injected on connect, if set
    #[serde(default)]
    pub payload_path: Option<PathBuf>,
    /// Bound on the remote loader thread
    #[serde(default = "default_inject_timeout_ms")]
    pub inject_timeout_ms: u64,
    /// How long a capture waits for a fresh frame
    #[serde(default = "default_frame_wait_ms")]
    pub frame_wait_ms: u64,
    /// Poll step while waiting for a fresh frame
    #[serde(default = "default_frame_poll_ms")]
    pub frame_poll_ms: u64,
    /// Discovery keys used when no window handle is given
    #[serde(default)]
    pub target: TargetConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_window_class")]
    pub window_class: String,
}

fn default_channel_name() -> String {
    shared::CHANNEL_NAME.to_string()
}

fn default_process_name() -> String {
    "StarEra.exe".to_string()
}

fn default_window_class() -> String {
    "UnityWndClass".to_string()
}

fn default_inject_timeout_ms() -> u64 {
    5000
}

fn default_frame_wait_ms() -> u64 {
    100
}

fn default_frame_poll_ms() -> u64 {
    10
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            payload_path: None,
            inject_timeout_ms: default_inject_timeout_ms(),
            frame_wait_ms: default_frame_wait_ms(),
            frame_poll_ms: default_frame_poll_ms(),
            target: TargetConfig::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            window_class: default_window_class(),
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.is_empty() {
            return Err(ConfigError::Invalid("channel_name is empty".into()));
        }
        // The payload attaches by the fixed name; any other name would leave it unattached.
        if self.payload_path.is_some() && self.channel_name != shared::CHANNEL_NAME {
            return Err(ConfigError::Invalid(format!(
                "channel_name must be {} when payload_path is set",
                shared::CHANNEL_NAME
            )));
        }
        if self.inject_timeout_ms == 0 {
            return Err(ConfigError::Invalid("inject_timeout_ms must be positive".into()));
        }
        if self.frame_poll_ms == 0 {
            return Err(ConfigError::Invalid("frame_poll_ms must be positive".into()));
        }
        if self.frame_poll_ms > self.frame_wait_ms {
            return Err(ConfigError::Invalid(format!(
                "frame_poll_ms ({}) exceeds frame_wait_ms ({})",
                self.frame_poll_ms, self.frame_wait_ms
            )));
        }
        Ok(())
    }

    pub fn inject_timeout(&self) -> Duration {
        Duration::from_millis(self.inject_timeout_ms)
    }

    pub fn frame_timing(&self) -> FrameTiming {
        FrameTiming {
            wait: Duration::from_millis(self.frame_wait_ms),
            poll: Duration::from_millis(self.frame_poll_ms),
        }
    }
}
