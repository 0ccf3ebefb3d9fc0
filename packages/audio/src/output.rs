//! Output device and processing thread
//!
//! A high-priority processing thread pulls fixed-size blocks from the mix
//! graph into an output queue; the cpal output callback drains that queue.
//! Switching devices replaces the stream but keeps the thread and the graph.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use parking_lot::Mutex;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::config::DEFAULT_CHANNELS;
use crate::error::{EngineError, Result};
use crate::graph::MixGraph;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDevice {
  pub id: String,
  pub name: String,
  pub max_channels: u16,
  pub is_default: bool,
}

/// Enumerate output devices of the default host
pub fn list_output_devices() -> Result<Vec<OutputDevice>> {
  let host = cpal::default_host();
  let default_name = host.default_output_device().and_then(|d| d.name().ok());

  let devices = host
    .output_devices()
    .map_err(|e| EngineError::Device(e.to_string()))?;

  let mut list = Vec::new();
  for device in devices {
    let Ok(name) = device.name() else {
      continue;
    };
    let max_channels = device
      .default_output_config()
      .map(|c| c.channels())
      .unwrap_or(DEFAULT_CHANNELS);
    list.push(OutputDevice {
      is_default: default_name.as_deref() == Some(name.as_str()),
      id: name.clone(),
      name,
      max_channels,
    });
  }
  Ok(list)
}

struct OutputShared {
  running: bool,
  output_queue: VecDeque<f32>,
  output_channels: u16,
}

pub struct AudioOutput {
  shared: Arc<Mutex<OutputShared>>,
  stream: Option<cpal::Stream>,
  process_thread: Option<JoinHandle<()>>,
  sample_rate: u32,
}

impl AudioOutput {
  /// Start the processing thread and open `device_id` (host default if `None`)
  pub fn start(graph: MixGraph, device_id: Option<&str>) -> Result<Self> {
    let sample_rate = graph.sample_rate();
    let shared = Arc::new(Mutex::new(OutputShared {
      running: true,
      output_queue: VecDeque::new(),
      output_channels: DEFAULT_CHANNELS,
    }));

    let process_thread = spawn_process_thread(graph, Arc::clone(&shared));

    let mut output = Self {
      shared,
      stream: None,
      process_thread: Some(process_thread),
      sample_rate,
    };
    output.switch_device(device_id)?;
    Ok(output)
  }

  /// Replace the output stream without touching engine state
  pub fn switch_device(&mut self, device_id: Option<&str>) -> Result<()> {
    let device = get_device(device_id)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let output_channels = device
      .default_output_config()
      .map_err(|e| EngineError::Device(format!("Device '{}' error: {}", device_name, e)))?
      .channels();

    if let Some(stream) = self.stream.take() {
      if let Err(e) = stream.pause() {
        log::warn!("[AudioOutput] Failed to pause old stream: {e}");
      }
    }

    {
      let mut shared = self.shared.lock();
      shared.output_channels = output_channels;
      // Queued audio has the old channel layout
      shared.output_queue.clear();
    }

    let stream = build_output_stream(
      &device,
      output_channels,
      self.sample_rate,
      Arc::clone(&self.shared),
    )?;
    self.stream = Some(stream);

    log::info!(
      "[AudioOutput] Device configured: {} channels={}, sample_rate={}",
      device_name,
      output_channels,
      self.sample_rate
    );
    Ok(())
  }

  pub fn close(&mut self) {
    self.stream = None;
    {
      let mut shared = self.shared.lock();
      shared.running = false;
      shared.output_queue.clear();
    }
    if let Some(thread) = self.process_thread.take() {
      let _ = thread.join();
    }
  }
}

impl Drop for AudioOutput {
  fn drop(&mut self) {
    self.close();
  }
}

fn spawn_process_thread(graph: MixGraph, shared: Arc<Mutex<OutputShared>>) -> JoinHandle<()> {
  thread::spawn(move || {
    match set_current_thread_priority(ThreadPriority::Max) {
      Ok(_) => log::info!("[AudioOutput] Process thread priority set to Max"),
      Err(e) => log::warn!("[AudioOutput] Could not set thread priority: {e:?}"),
    }

    let sample_rate = graph.sample_rate().max(1);
    let block_size = graph.block_size();
    let mut block = vec![0.0f32; block_size * DEFAULT_CHANNELS as usize];

    // Keep at least ~100ms or one block queued
    let target_frames = (sample_rate as usize / 10).max(block_size);
    let interval = Duration::from_micros(
      ((block_size.min(1024) as f64 / sample_rate as f64) * 1_000_000.0 * 0.8) as u64,
    );

    loop {
      let (running, queued, output_channels) = {
        let shared = shared.lock();
        (
          shared.running,
          shared.output_queue.len(),
          shared.output_channels as usize,
        )
      };
      if !running {
        break;
      }

      if queued < target_frames * output_channels * 2 {
        graph.render(&mut block);
        let mut shared = shared.lock();
        push_frames(&mut shared.output_queue, &block, output_channels);
      }

      thread::sleep(interval);
    }

    log::debug!("[AudioOutput] Process thread exiting");
  })
}

/// Stereo block to the device layout: channels 0 and 1, the rest silent
fn push_frames(queue: &mut VecDeque<f32>, stereo: &[f32], output_channels: usize) {
  for frame in stereo.chunks_exact(DEFAULT_CHANNELS as usize) {
    match output_channels {
      0 => {}
      1 => queue.push_back((frame[0] + frame[1]) * 0.5),
      n => {
        queue.push_back(frame[0]);
        queue.push_back(frame[1]);
        queue.extend(std::iter::repeat(0.0).take(n - 2));
      }
    }
  }
}

/// Find an output device by name, falling back to the default device
fn get_device(device_id: Option<&str>) -> Result<cpal::Device> {
  let host = cpal::default_host();

  if let Some(name) = device_id {
    let devices = host
      .output_devices()
      .map_err(|e| EngineError::Device(e.to_string()))?;
    for device in devices {
      if device.name().map(|n| n == name).unwrap_or(false) {
        return Ok(device);
      }
    }
    log::warn!("[AudioOutput] Device '{}' not found, using default", name);
  }

  host
    .default_output_device()
    .ok_or_else(|| EngineError::Device("No default output device available".to_string()))
}

fn build_output_stream(
  device: &cpal::Device,
  output_channels: u16,
  sample_rate: u32,
  shared: Arc<Mutex<OutputShared>>,
) -> Result<cpal::Stream> {
  let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

  let config = device.default_output_config().map_err(|e| {
    EngineError::Device(format!(
      "Device '{}' does not support output: {}",
      device_name, e
    ))
  })?;

  if config.sample_format() != SampleFormat::F32 {
    return Err(EngineError::Device(
      "Device does not support f32 output".to_string(),
    ));
  }

  if config.sample_rate().0 != sample_rate {
    log::warn!(
      "[AudioOutput] Device '{}' runs at {} Hz, requesting {} Hz",
      device_name,
      config.sample_rate().0,
      sample_rate
    );
  }

  let mut final_config = config.config();
  final_config.channels = output_channels;
  final_config.sample_rate = cpal::SampleRate(sample_rate);

  let stream = device
    .build_output_stream(
      &final_config,
      move |data: &mut [f32], _| {
        let mut shared = shared.lock();
        for sample in data.iter_mut() {
          *sample = shared.output_queue.pop_front().unwrap_or(0.0);
        }
      },
      move |err| log::error!("[AudioOutput] Output stream error: {err}"),
      None,
    )
    .map_err(|e| EngineError::Device(format!("Failed to build audio stream: {e}")))?;

  stream
    .play()
    .map_err(|e| EngineError::Device(format!("Failed to start audio stream: {e}")))?;

  Ok(stream)
}
