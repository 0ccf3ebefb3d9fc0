//! Engine configuration
//!
//! Stored as YAML by the host application. Every field has a default so a
//! partial (or missing) file still yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: u16 = 2;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

const MIN_BUFFER_SIZE: usize = 256;
const MAX_BUFFER_SIZE: usize = 16_384;

/// Read-only settings the engine consumes from the settings store
pub trait Settings {
  /// Frames rendered per processing block
  fn audio_buffer_size(&self) -> usize;
  /// How long alerts stay visible
  fn error_message_timeout(&self) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Engine sample rate; decoded assets are resampled to it
  pub sample_rate: u32,
  /// Processing block size in frames (4096, 8192 or 16384 in the settings menu)
  pub audio_buffer_size: usize,
  /// Alert timeout in seconds
  pub error_message_timeout_secs: u64,
  /// Impulse response used by the microphone reverb sends
  pub reverb_impulse_path: String,
  /// Output device name, `None` for the host default
  pub output_device: Option<String>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      sample_rate: DEFAULT_SAMPLE_RATE,
      audio_buffer_size: DEFAULT_BUFFER_SIZE,
      error_message_timeout_secs: 5,
      reverb_impulse_path: "assets/impulses/impulse_rev.wav".to_string(),
      output_device: None,
    }
  }
}

impl EngineConfig {
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: EngineConfig =
      serde_yaml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))?;
    Ok(config.sanitized())
  }

  /// Load configuration from a YAML file
  ///
  /// A missing or unreadable file yields the defaults.
  pub fn load(path: &Path) -> Self {
    if !path.exists() {
      log::info!("[Config] {:?} does not exist, using defaults", path);
      return Self::default();
    }

    match std::fs::read_to_string(path) {
      Ok(contents) => match Self::from_yaml_str(&contents) {
        Ok(config) => config,
        Err(e) => {
          log::warn!("[Config] {:?} is invalid ({}), using defaults", path, e);
          Self::default()
        }
      },
      Err(e) => {
        log::warn!("[Config] Failed to read {:?}: {}", path, e);
        Self::default()
      }
    }
  }

  /// Replace out-of-range values with their defaults
  pub fn sanitized(mut self) -> Self {
    let size = self.audio_buffer_size;
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) || !size.is_power_of_two() {
      log::warn!(
        "[Config] audio_buffer_size {} unsupported, falling back to {}",
        size,
        DEFAULT_BUFFER_SIZE
      );
      self.audio_buffer_size = DEFAULT_BUFFER_SIZE;
    }
    if self.sample_rate == 0 {
      log::warn!("[Config] sample_rate 0 unsupported, falling back to {}", DEFAULT_SAMPLE_RATE);
      self.sample_rate = DEFAULT_SAMPLE_RATE;
    }
    self
  }
}

impl Settings for EngineConfig {
  fn audio_buffer_size(&self) -> usize {
    self.audio_buffer_size
  }

  fn error_message_timeout(&self) -> Duration {
    Duration::from_secs(self.error_message_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = EngineConfig::from_yaml_str("audio_buffer_size: 8192\n").unwrap();
    assert_eq!(config.audio_buffer_size, 8192);
    assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
    assert_eq!(config.error_message_timeout(), Duration::from_secs(5));
  }

  #[test]
  fn test_invalid_buffer_size_falls_back() {
    let config = EngineConfig::from_yaml_str("audio_buffer_size: 5000\n").unwrap();
    assert_eq!(config.audio_buffer_size, DEFAULT_BUFFER_SIZE);
  }

  #[test]
  fn test_malformed_yaml_is_config_error() {
    let err = EngineConfig::from_yaml_str("audio_buffer_size: [").unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
  }

  #[test]
  fn test_missing_file_yields_defaults() {
    let config = EngineConfig::load(Path::new("/nonexistent/karaoke/config.yaml"));
    assert_eq!(config, EngineConfig::default());
  }
}
