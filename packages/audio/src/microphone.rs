//! Microphone chains
//!
//! Each of the two chains is an independent state machine:
//!
//! ```text
//! Idle --enable--> Requesting --success--> Connected --suspend--> Suspended
//!                      |                      |  ^                    |
//!                   failure                disable +------resume------+
//!                      v                      v
//!                     Idle                   Idle
//! ```
//!
//! Acquisition is keyed by a per-channel request token so a superseded
//! request (rapid device switch, disable while pending) completes as a no-op.
//! The channel owns its device handle exclusively; dropping the handle
//! releases the device.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::loader::{RequestToken, TokenCounter};

pub const DEFAULT_DEVICE_ID: &str = "default";
pub const DEFAULT_MIC_VOLUME: f64 = 50.0;
pub const DEFAULT_REVERB_VOLUME: f64 = 50.0;

/// Captured mono samples at the engine sample rate, drained by the mix graph
pub type MicInput = Arc<Mutex<VecDeque<f32>>>;

pub fn new_mic_input() -> MicInput {
  Arc::new(Mutex::new(VecDeque::new()))
}

/// Append captured samples, dropping the oldest beyond `capacity`
pub fn push_mic_samples(input: &MicInput, samples: impl IntoIterator<Item = f32>, capacity: usize) {
  let mut queue = input.lock();
  queue.extend(samples);
  let excess = queue.len().saturating_sub(capacity);
  if excess > 0 {
    queue.drain(..excess);
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MicrophoneStatus {
  Idle,
  Requesting,
  Connected,
  Suspended,
}

/// Constraints a capture device is opened with
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureConstraints {
  pub noise_suppression: bool,
  /// Rate the captured signal is delivered at
  pub sample_rate: u32,
  /// Maximum buffered samples before the oldest are dropped
  pub buffer_capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDevice {
  pub id: String,
  pub name: String,
  pub is_default: bool,
}

/// An open capture device; dropping it releases the device
pub struct InputHandle {
  device_id: String,
  _resource: Box<dyn Any>,
}

impl InputHandle {
  pub fn new(device_id: impl Into<String>, resource: Box<dyn Any>) -> Self {
    Self {
      device_id: device_id.into(),
      _resource: resource,
    }
  }

  pub fn device_id(&self) -> &str {
    &self.device_id
  }
}

impl std::fmt::Debug for InputHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InputHandle")
      .field("device_id", &self.device_id)
      .finish()
  }
}

/// Source of capture devices
pub trait InputBackend {
  fn enumerate(&self) -> Result<Vec<InputDevice>>;
  /// Open `device_id`, delivering mono samples into `sink`
  fn open(
    &mut self,
    device_id: &str,
    constraints: CaptureConstraints,
    sink: MicInput,
  ) -> Result<InputHandle>;
}

/// UI-visible state of one chain
#[derive(Clone, Debug, PartialEq)]
pub struct MicrophoneState {
  pub enabled: bool,
  pub noise_suppression: bool,
  pub device_id: String,
  /// 0-100
  pub volume: f64,
  pub reverb_enabled: bool,
  /// 0-100
  pub reverb_volume: f64,
  /// Whether the reverb impulse is loaded
  pub reverb_available: bool,
  pub status: MicrophoneStatus,
}

impl Default for MicrophoneState {
  fn default() -> Self {
    Self {
      enabled: false,
      noise_suppression: false,
      device_id: DEFAULT_DEVICE_ID.to_string(),
      volume: DEFAULT_MIC_VOLUME,
      reverb_enabled: false,
      reverb_volume: DEFAULT_REVERB_VOLUME,
      reverb_available: false,
      status: MicrophoneStatus::Idle,
    }
  }
}

/// Outcome of applying an acquisition result
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
  Connected,
  /// A newer request superseded this one; nothing changed
  Stale,
}

pub struct MicrophoneChannel {
  index: usize,
  state: MicrophoneState,
  handle: Option<InputHandle>,
  input: Option<MicInput>,
  tokens: TokenCounter,
  pending: Option<(RequestToken, MicInput)>,
}

impl MicrophoneChannel {
  pub fn new(index: usize) -> Self {
    Self {
      index,
      state: MicrophoneState::default(),
      handle: None,
      input: None,
      tokens: TokenCounter::default(),
      pending: None,
    }
  }

  pub fn index(&self) -> usize {
    self.index
  }

  pub fn state(&self) -> &MicrophoneState {
    &self.state
  }

  pub fn status(&self) -> MicrophoneStatus {
    self.state.status
  }

  pub fn handle(&self) -> Option<&InputHandle> {
    self.handle.as_ref()
  }

  /// Capture buffer of the connected device
  pub fn input(&self) -> Option<&MicInput> {
    self.input.as_ref()
  }

  /// Start acquiring the selected device
  ///
  /// Returns the request token and the buffer the device must deliver into.
  pub fn begin_request(&mut self) -> (RequestToken, MicInput) {
    let token = self.tokens.next();
    let sink = new_mic_input();
    self.state.status = MicrophoneStatus::Requesting;
    self.pending = Some((token, sink.clone()));
    log::debug!(
      "[Microphone {}] Requesting device '{}' (noise suppression {})",
      self.index,
      self.state.device_id,
      self.state.noise_suppression
    );
    (token, sink)
  }

  /// Apply the result of an acquisition started with `begin_request`
  pub fn complete_request(
    &mut self,
    token: RequestToken,
    result: Result<InputHandle>,
  ) -> Result<Completion> {
    let sink = match self.pending.take() {
      Some((pending, sink)) if pending == token => sink,
      other => {
        self.pending = other;
        log::warn!(
          "[Microphone {}] Dropping stale acquisition result {:?}",
          self.index,
          token
        );
        return Ok(Completion::Stale);
      }
    };

    match result {
      Ok(handle) => {
        log::info!(
          "[Microphone {}] Connected to '{}'",
          self.index,
          handle.device_id()
        );
        self.handle = Some(handle);
        self.input = Some(sink);
        self.state.enabled = true;
        self.state.status = MicrophoneStatus::Connected;
        Ok(Completion::Connected)
      }
      Err(e) => {
        log::error!(
          "[Microphone {}] Cannot open '{}': {}",
          self.index,
          self.state.device_id,
          e
        );
        self.release();
        Err(EngineError::microphone_unavailable(
          self.state.noise_suppression,
        ))
      }
    }
  }

  /// Disconnect and release the device
  pub fn disable(&mut self) {
    self.pending = None;
    self.release();
  }

  fn release(&mut self) {
    if self.handle.take().is_some() {
      log::info!("[Microphone {}] Released device", self.index);
    }
    self.input = None;
    self.state.enabled = false;
    self.state.status = MicrophoneStatus::Idle;
  }

  /// Detach from the mix while keeping the device open
  pub fn suspend(&mut self) -> bool {
    if self.state.status == MicrophoneStatus::Connected {
      self.state.status = MicrophoneStatus::Suspended;
      return true;
    }
    false
  }

  pub fn resume(&mut self) -> bool {
    if self.state.status == MicrophoneStatus::Suspended {
      self.state.status = MicrophoneStatus::Connected;
      return true;
    }
    false
  }

  /// Connected or suspended with an open device
  pub fn is_acquired(&self) -> bool {
    matches!(
      self.state.status,
      MicrophoneStatus::Connected | MicrophoneStatus::Suspended
    )
  }

  pub fn set_device(&mut self, device_id: impl Into<String>) {
    self.state.device_id = device_id.into();
  }

  pub fn set_noise_suppression(&mut self, enabled: bool) {
    self.state.noise_suppression = enabled;
  }

  pub fn set_volume(&mut self, volume: f64) {
    self.state.volume = volume.clamp(0.0, 100.0);
  }

  pub fn set_reverb_volume(&mut self, volume: f64) {
    self.state.reverb_volume = volume.clamp(0.0, 100.0);
  }

  pub fn set_reverb_enabled(&mut self, enabled: bool) {
    self.state.reverb_enabled = enabled;
  }

  pub fn set_reverb_available(&mut self, available: bool) {
    self.state.reverb_available = available;
  }

  /// Default device, both volumes at 50
  pub fn restore_defaults(&mut self) {
    self.state.device_id = DEFAULT_DEVICE_ID.to_string();
    self.state.volume = DEFAULT_MIC_VOLUME;
    self.state.reverb_volume = DEFAULT_REVERB_VOLUME;
  }
}

/// Linear resampler for captured mono audio
struct MonoResampler {
  ratio: f64,
  position: f64,
  last: f32,
}

impl MonoResampler {
  fn new(source_rate: u32, target_rate: u32) -> Self {
    Self {
      ratio: source_rate as f64 / target_rate.max(1) as f64,
      position: 0.0,
      last: 0.0,
    }
  }

  fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
    if (self.ratio - 1.0).abs() < f64::EPSILON {
      output.extend_from_slice(input);
      return;
    }

    // Index 0 is the last sample of the previous call, input starts at 1
    let n = input.len();
    let last = self.last;
    let at = |i: usize| if i == 0 { last } else { input[i - 1] };
    while (self.position as usize) < n {
      let i = self.position as usize;
      let frac = (self.position - i as f64) as f32;
      let (a, b) = (at(i), at(i + 1));
      output.push(a + (b - a) * frac);
      self.position += self.ratio;
    }
    self.position -= n as f64;
    if let Some(last) = input.last() {
      self.last = *last;
    }
  }
}

/// Capture through the host's cpal input devices
#[derive(Default)]
pub struct CpalInputBackend;

impl CpalInputBackend {
  fn find_device(&self, device_id: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if device_id != DEFAULT_DEVICE_ID {
      let devices = host
        .input_devices()
        .map_err(|e| EngineError::Device(e.to_string()))?;
      for device in devices {
        if device.name().map(|n| n == device_id).unwrap_or(false) {
          return Ok(device);
        }
      }
      return Err(EngineError::Device(format!(
        "input device '{}' not found",
        device_id
      )));
    }

    host
      .default_input_device()
      .ok_or_else(|| EngineError::Device("No default input device available".to_string()))
  }
}

impl InputBackend for CpalInputBackend {
  fn enumerate(&self) -> Result<Vec<InputDevice>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
      .input_devices()
      .map_err(|e| EngineError::DeviceEnumerationFailed(e.to_string()))?;

    let mut list = vec![InputDevice {
      id: DEFAULT_DEVICE_ID.to_string(),
      name: "Default".to_string(),
      is_default: true,
    }];
    for device in devices {
      let Ok(name) = device.name() else {
        continue;
      };
      list.push(InputDevice {
        is_default: default_name.as_deref() == Some(name.as_str()),
        id: name.clone(),
        name,
      });
    }
    Ok(list)
  }

  fn open(
    &mut self,
    device_id: &str,
    constraints: CaptureConstraints,
    sink: MicInput,
  ) -> Result<InputHandle> {
    let device = self.find_device(device_id)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let input_config = device
      .default_input_config()
      .map_err(|e| EngineError::Device(format!("Device '{}' has no input: {}", device_name, e)))?;

    if input_config.sample_format() != SampleFormat::F32 {
      return Err(EngineError::Device(format!(
        "Device '{}' does not support f32 input",
        device_name
      )));
    }

    let input_sample_rate = input_config.sample_rate().0;
    let input_channels = input_config.channels() as usize;
    let mut resampler = MonoResampler::new(input_sample_rate, constraints.sample_rate);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();
    let capacity = constraints.buffer_capacity;

    let stream = device
      .build_input_stream(
        &input_config.into(),
        move |data: &[f32], _| {
          // First channel only
          mono.clear();
          mono.extend(data.iter().step_by(input_channels.max(1)).copied());
          resampled.clear();
          resampler.process(&mono, &mut resampled);
          push_mic_samples(&sink, resampled.iter().copied(), capacity);
        },
        move |err| log::error!("[Microphone] Input stream error: {err}"),
        None,
      )
      .map_err(|e| EngineError::Device(format!("Could not create input stream: {e}")))?;

    stream
      .play()
      .map_err(|e| EngineError::Device(format!("Failed to start input stream: {e}")))?;

    log::info!(
      "[Microphone] Opened '{}' ({} channels, {} Hz)",
      device_name,
      input_channels,
      input_sample_rate
    );

    Ok(InputHandle::new(device_id, Box::new(stream)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ScriptedInputBackend;

  fn constraints() -> CaptureConstraints {
    CaptureConstraints {
      noise_suppression: false,
      sample_rate: 44_100,
      buffer_capacity: 8192,
    }
  }

  fn acquire(channel: &mut MicrophoneChannel, backend: &mut ScriptedInputBackend) -> Result<Completion> {
    let (token, sink) = channel.begin_request();
    let device = channel.state().device_id.clone();
    let mut c = constraints();
    c.noise_suppression = channel.state().noise_suppression;
    let result = backend.open(&device, c, sink);
    channel.complete_request(token, result)
  }

  #[test]
  fn test_enable_connects() {
    let mut backend = ScriptedInputBackend::new(&["default", "USB Mic"]);
    let mut channel = MicrophoneChannel::new(0);

    assert_eq!(channel.status(), MicrophoneStatus::Idle);
    assert_eq!(acquire(&mut channel, &mut backend), Ok(Completion::Connected));
    assert_eq!(channel.status(), MicrophoneStatus::Connected);
    assert!(channel.state().enabled);
    assert_eq!(channel.handle().unwrap().device_id(), "default");
    assert!(channel.input().is_some());
  }

  #[test]
  fn test_failure_returns_to_idle_with_plain_message() {
    let mut backend = ScriptedInputBackend::new(&["default"]);
    let mut channel = MicrophoneChannel::new(1);
    channel.set_device("Broken Mic");

    let err = acquire(&mut channel, &mut backend).unwrap_err();
    assert_eq!(err, EngineError::MicrophoneUnavailable);
    assert_eq!(channel.status(), MicrophoneStatus::Idle);
    assert!(!channel.state().enabled);
    assert!(channel.handle().is_none());
  }

  #[test]
  fn test_failure_with_noise_suppression_has_distinct_message() {
    let mut backend = ScriptedInputBackend::new(&["default"]);
    backend.reject_noise_suppression("default");
    let mut channel = MicrophoneChannel::new(0);
    channel.set_noise_suppression(true);

    let err = acquire(&mut channel, &mut backend).unwrap_err();
    assert_eq!(err, EngineError::MicrophoneUnavailableWithNoiseSuppression);
    assert_eq!(channel.status(), MicrophoneStatus::Idle);
    assert_eq!(backend.last_constraints.map(|c| c.noise_suppression), Some(true));
  }

  #[test]
  fn test_stale_completion_is_discarded() {
    let mut backend = ScriptedInputBackend::new(&["default", "USB Mic"]);
    let mut channel = MicrophoneChannel::new(0);

    let (first, first_sink) = channel.begin_request();
    channel.set_device("USB Mic");
    let (second, second_sink) = channel.begin_request();

    let late = backend.open("default", constraints(), first_sink);
    assert_eq!(channel.complete_request(first, late), Ok(Completion::Stale));
    assert_eq!(channel.status(), MicrophoneStatus::Requesting);
    assert_eq!(backend.open_count(), 0);

    let result = backend.open("USB Mic", constraints(), second_sink);
    assert_eq!(channel.complete_request(second, result), Ok(Completion::Connected));
    assert_eq!(channel.handle().unwrap().device_id(), "USB Mic");
  }

  #[test]
  fn test_disable_releases_handle_and_invalidates_pending() {
    let mut backend = ScriptedInputBackend::new(&["default"]);
    let mut channel = MicrophoneChannel::new(0);
    acquire(&mut channel, &mut backend).unwrap();
    assert_eq!(backend.open_count(), 1);

    channel.disable();
    assert_eq!(channel.status(), MicrophoneStatus::Idle);
    assert_eq!(backend.open_count(), 0);

    let (token, sink) = channel.begin_request();
    channel.disable();
    let result = backend.open("default", constraints(), sink);
    assert_eq!(channel.complete_request(token, result), Ok(Completion::Stale));
    assert_eq!(channel.status(), MicrophoneStatus::Idle);
    assert_eq!(backend.open_count(), 0);
  }

  #[test]
  fn test_suspend_and_resume_keep_handle() {
    let mut backend = ScriptedInputBackend::new(&["default"]);
    let mut channel = MicrophoneChannel::new(0);
    assert!(!channel.suspend());
    acquire(&mut channel, &mut backend).unwrap();

    assert!(channel.suspend());
    assert_eq!(channel.status(), MicrophoneStatus::Suspended);
    assert!(channel.handle().is_some());
    assert!(channel.resume());
    assert_eq!(channel.status(), MicrophoneStatus::Connected);
  }

  #[test]
  fn test_restore_defaults() {
    let mut channel = MicrophoneChannel::new(0);
    channel.set_device("USB Mic");
    channel.set_volume(90.0);
    channel.set_reverb_volume(10.0);
    channel.restore_defaults();
    assert_eq!(channel.state().device_id, "default");
    assert_eq!(channel.state().volume, 50.0);
    assert_eq!(channel.state().reverb_volume, 50.0);
  }

  #[test]
  fn test_push_drops_oldest_beyond_capacity() {
    let input = new_mic_input();
    push_mic_samples(&input, (0..10).map(|i| i as f32), 4);
    let queue = input.lock();
    assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![6.0, 7.0, 8.0, 9.0]);
  }

  #[test]
  fn test_resampler_halves_rate() {
    let mut resampler = MonoResampler::new(88_200, 44_100);
    let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let mut output = Vec::new();
    resampler.process(&input, &mut output);
    assert_eq!(output.len(), 50);
    assert_eq!(output[10], 19.0);
  }
}
