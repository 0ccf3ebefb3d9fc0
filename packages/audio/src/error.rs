//! Error kinds surfaced by the engine and the alerts they turn into.

use std::time::Duration;

use thiserror::Error;

/// How loudly an alert should be presented to the user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Info => "info",
      Severity::Success => "success",
      Severity::Warning => "warning",
      Severity::Error => "error",
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
  #[error("{0} does not exist")]
  FileNotFound(String),

  #[error("Error loading song: {0}")]
  DecodeError(String),

  #[error("Invalid audio buffer: {0}")]
  InvalidBuffer(String),

  #[error("Song must be processed for vocals to be turned off")]
  StemUnavailable,

  #[error("Cannot connect to selected microphone, please change input in settings")]
  MicrophoneUnavailable,

  #[error(
    "Cannot connect to selected microphone with noise suppression enabled, please change input in settings"
  )]
  MicrophoneUnavailableWithNoiseSuppression,

  #[error("reverb error: {0} not found, reinstall application to restore file")]
  ReverbAssetMissing(String),

  #[error("cannot detect audio input devices: {0}")]
  DeviceEnumerationFailed(String),

  #[error("error loading lyrics file: {0}")]
  LyricsReadError(String),

  #[error("Error updating lyrics file: {0}")]
  LyricsWriteError(String),

  #[error("No lyrics file found")]
  NoLyricsFile,

  #[error("No lyrics found, go to song details to fetch lyrics or upload lyrics file")]
  LyricsUnavailable,

  #[error("Song must be processed for graph to be displayed")]
  GraphUnavailable,

  #[error("No songs in queue")]
  QueueEmpty,

  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("Audio device error: {0}")]
  Device(String),
}

impl EngineError {
  /// Expected conditions are informational, I/O and hardware failures are errors
  pub fn severity(&self) -> Severity {
    match self {
      EngineError::StemUnavailable
      | EngineError::QueueEmpty
      | EngineError::NoLyricsFile
      | EngineError::LyricsUnavailable
      | EngineError::GraphUnavailable => Severity::Info,
      EngineError::Config(_) | EngineError::LyricsWriteError(_) => Severity::Warning,
      _ => Severity::Error,
    }
  }

  /// Failure message for a microphone that could not be opened
  pub fn microphone_unavailable(noise_suppression: bool) -> Self {
    if noise_suppression {
      EngineError::MicrophoneUnavailableWithNoiseSuppression
    } else {
      EngineError::MicrophoneUnavailable
    }
  }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A single user-visible message
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
  pub severity: Severity,
  pub message: String,
  /// How long the UI keeps the alert on screen
  pub timeout: Duration,
}

impl Alert {
  pub fn from_error(err: &EngineError, timeout: Duration) -> Self {
    Self {
      severity: err.severity(),
      message: err.to_string(),
      timeout,
    }
  }

  pub fn success(message: impl Into<String>, timeout: Duration) -> Self {
    Self {
      severity: Severity::Success,
      message: message.into(),
      timeout,
    }
  }
}
