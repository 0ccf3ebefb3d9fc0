//! Test doubles and fixtures shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decoder::DecodedBuffer;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::microphone::{
  CaptureConstraints, InputBackend, InputDevice, InputHandle, MicInput, DEFAULT_DEVICE_ID,
};

/// 16-bit PCM WAV file bytes
pub fn wav_bytes(samples: &[f32], channels: u16, sample_rate: u32) -> Vec<u8> {
  let spec = hound::WavSpec {
    channels,
    sample_rate,
    bits_per_sample: 16,
    sample_format: hound::SampleFormat::Int,
  };
  let mut bytes = Vec::new();
  {
    let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
    for sample in samples {
      writer
        .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .unwrap();
    }
    writer.finalize().unwrap();
  }
  bytes
}

/// Stereo sine at 44.1 kHz
pub fn sine_buffer(freq: f32, seconds: f32) -> DecodedBuffer {
  let frames = (44_100.0 * seconds) as usize;
  let mut samples = Vec::with_capacity(frames * 2);
  for i in 0..frames {
    let s = (2.0 * std::f32::consts::PI * freq * i as f32 / 44_100.0).sin() * 0.5;
    samples.push(s);
    samples.push(s);
  }
  DecodedBuffer::from_interleaved(samples, 44_100)
}

/// Stereo sine WAV file bytes at 44.1 kHz
pub fn sine_wav(freq: f32, seconds: f32) -> Vec<u8> {
  wav_bytes(sine_buffer(freq, seconds).samples(), 2, 44_100)
}

#[derive(Default)]
pub struct MemoryFileSystem {
  files: Mutex<HashMap<String, Vec<u8>>>,
  failing_reads: Mutex<HashSet<String>>,
  failing_writes: Mutex<HashSet<String>>,
  writes: AtomicUsize,
}

impl MemoryFileSystem {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert_binary(&self, path: &str, bytes: Vec<u8>) {
    self.files.lock().insert(path.to_string(), bytes);
  }

  pub fn insert_text(&self, path: &str, text: &str) {
    self.insert_binary(path, text.as_bytes().to_vec());
  }

  pub fn remove(&self, path: &str) {
    self.files.lock().remove(path);
  }

  pub fn fail_reads(&self, path: &str) {
    self.failing_reads.lock().insert(path.to_string());
  }

  pub fn fail_writes(&self, path: &str) {
    self.failing_writes.lock().insert(path.to_string());
  }

  pub fn text(&self, path: &str) -> Option<String> {
    self
      .files
      .lock()
      .get(path)
      .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
  }

  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }
}

impl FileSystem for MemoryFileSystem {
  fn file_exists(&self, path: &str) -> bool {
    self.files.lock().contains_key(path)
  }

  fn read_text(&self, path: &str) -> io::Result<String> {
    let bytes = self.read_binary(path)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
  }

  fn read_binary(&self, path: &str) -> io::Result<Vec<u8>> {
    if self.failing_reads.lock().contains(path) {
      return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read denied"));
    }
    self
      .files
      .lock()
      .get(path)
      .cloned()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path)))
  }

  fn write_text(&self, path: &str, data: &str) -> io::Result<()> {
    if self.failing_writes.lock().contains(path) {
      return Err(io::Error::new(io::ErrorKind::PermissionDenied, "write denied"));
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.insert_text(path, data);
    Ok(())
  }
}

/// Decrements the live-handle count when the scripted device is released
struct HandleGuard(Arc<AtomicUsize>);

impl Drop for HandleGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Input backend with a fixed device list and scripted failures
pub struct ScriptedInputBackend {
  devices: Vec<String>,
  reject_noise_suppression: HashSet<String>,
  fail_enumeration: bool,
  live_handles: Arc<AtomicUsize>,
  pub last_constraints: Option<CaptureConstraints>,
}

impl ScriptedInputBackend {
  pub fn new(devices: &[&str]) -> Self {
    Self {
      devices: devices.iter().map(|d| d.to_string()).collect(),
      reject_noise_suppression: HashSet::new(),
      fail_enumeration: false,
      live_handles: Arc::new(AtomicUsize::new(0)),
      last_constraints: None,
    }
  }

  /// Opening `device` with noise suppression fails
  pub fn reject_noise_suppression(&mut self, device: &str) {
    self.reject_noise_suppression.insert(device.to_string());
  }

  pub fn fail_enumeration(&mut self) {
    self.fail_enumeration = true;
  }

  /// Handles currently held open
  pub fn open_count(&self) -> usize {
    self.live_handles.load(Ordering::SeqCst)
  }

  pub fn live_handles(&self) -> Arc<AtomicUsize> {
    Arc::clone(&self.live_handles)
  }
}

impl InputBackend for ScriptedInputBackend {
  fn enumerate(&self) -> Result<Vec<InputDevice>> {
    if self.fail_enumeration {
      return Err(EngineError::DeviceEnumerationFailed(
        "permission denied".to_string(),
      ));
    }
    Ok(
      self
        .devices
        .iter()
        .map(|d| InputDevice {
          id: d.clone(),
          name: d.clone(),
          is_default: d == DEFAULT_DEVICE_ID,
        })
        .collect(),
    )
  }

  fn open(
    &mut self,
    device_id: &str,
    constraints: CaptureConstraints,
    _sink: MicInput,
  ) -> Result<InputHandle> {
    self.last_constraints = Some(constraints);
    if !self.devices.iter().any(|d| d == device_id) {
      return Err(EngineError::Device(format!("no device '{}'", device_id)));
    }
    if constraints.noise_suppression && self.reject_noise_suppression.contains(device_id) {
      return Err(EngineError::Device(
        "constraint not satisfiable".to_string(),
      ));
    }
    self.live_handles.fetch_add(1, Ordering::SeqCst);
    Ok(InputHandle::new(
      device_id,
      Box::new(HandleGuard(Arc::clone(&self.live_handles))),
    ))
  }
}
