//! Time-stretch source
//!
//! Plays exactly one decoded buffer through SoundTouch so pitch (semitones)
//! and tempo (ratio) can change on the running signal independently of each
//! other. A new buffer means a new source; sources are never re-pointed.

use soundtouch::{Setting, SoundTouch};

use crate::config::DEFAULT_CHANNELS;
use crate::decoder::DecodedBuffer;
use crate::error::{EngineError, Result};

/// Frames handed to SoundTouch per feed
const FEED_FRAMES: usize = 1024;
pub const MIN_TEMPO: f64 = 0.1;
pub const MAX_TEMPO: f64 = 4.0;

pub struct TimeStretchSource {
  buffer: DecodedBuffer,
  soundtouch: SoundTouch,
  /// Input frames already handed to SoundTouch
  position: usize,
  /// Playback clock in source frames, advanced by output frames * tempo
  clock_frames: f64,
  pitch_semitones: f64,
  tempo: f64,
  stopped: bool,
  output_buffer: Vec<f32>,
  /// Output frames SoundTouch produced but the graph has not pulled yet
  reservoir: Vec<f32>,
}

impl TimeStretchSource {
  /// Wrap `buffer`; playback starts at 0
  pub fn new(buffer: DecodedBuffer) -> Result<Self> {
    if buffer.is_empty() {
      return Err(EngineError::InvalidBuffer("buffer has no frames".to_string()));
    }
    if buffer.sample_rate() == 0 {
      return Err(EngineError::InvalidBuffer("buffer has no sample rate".to_string()));
    }

    let mut soundtouch = SoundTouch::new();
    soundtouch
      .set_channels(DEFAULT_CHANNELS as u32)
      .set_sample_rate(buffer.sample_rate())
      .set_tempo(1.0)
      .set_pitch(1.0)
      .set_setting(Setting::UseQuickseek, 1);

    Ok(Self {
      buffer,
      soundtouch,
      position: 0,
      clock_frames: 0.0,
      pitch_semitones: 0.0,
      tempo: 1.0,
      stopped: false,
      output_buffer: vec![0.0; FEED_FRAMES * DEFAULT_CHANNELS as usize * 2],
      reservoir: Vec::new(),
    })
  }

  pub fn pitch(&self) -> f64 {
    self.pitch_semitones
  }

  pub fn tempo(&self) -> f64 {
    self.tempo
  }

  /// Shift pitch by `semitones` without touching tempo
  pub fn set_pitch(&mut self, semitones: f64) {
    if !semitones.is_finite() {
      return;
    }
    self.pitch_semitones = semitones;
    self.soundtouch.set_pitch(2f64.powf(semitones / 12.0));
  }

  /// Change playback speed without touching pitch
  pub fn set_tempo(&mut self, ratio: f64) {
    if !ratio.is_finite() {
      return;
    }
    let ratio = ratio.clamp(MIN_TEMPO, MAX_TEMPO);
    self.tempo = ratio;
    self.soundtouch.set_tempo(ratio);
  }

  pub fn duration(&self) -> f64 {
    self.buffer.duration()
  }

  /// Playback clock in seconds of source material
  pub fn current_time(&self) -> f64 {
    (self.clock_frames / self.buffer.sample_rate() as f64).min(self.duration())
  }

  pub fn seek(&mut self, time_seconds: f64) {
    let total_frames = self.buffer.frames();
    let target = (time_seconds.max(0.0) * self.buffer.sample_rate() as f64) as usize;
    self.position = target.min(total_frames);
    self.clock_frames = self.position as f64;
    self.stopped = false;
    self.clear();
  }

  /// Stop producing output; the source renders silence until seeked
  pub fn stop(&mut self) {
    self.stopped = true;
    self.clear();
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped
  }

  /// All input consumed and every stretched frame delivered
  pub fn is_finished(&self) -> bool {
    self.position >= self.buffer.frames() && self.reservoir.is_empty()
  }

  /// Render `frames` stereo frames into `output`, returning frames written
  ///
  /// The remainder of `output` is filled with silence.
  pub fn render(&mut self, output: &mut [f32], frames: usize) -> usize {
    let channels = DEFAULT_CHANNELS as usize;
    let samples_needed = frames * channels;

    if self.stopped {
      output[..samples_needed].fill(0.0);
      return 0;
    }

    // Arc clone; keeps the samples readable while SoundTouch output is collected
    let buffer = self.buffer.clone();
    let pcm = buffer.samples();
    let total_frames = buffer.frames();
    let target_reservoir = frames * 2;

    // Feed only enough input to keep the reservoir topped up
    while self.reservoir.len() / channels < target_reservoir {
      let remaining = total_frames.saturating_sub(self.position);
      if remaining == 0 {
        break;
      }

      let chunk = remaining.min(FEED_FRAMES);
      let start = self.position * channels;
      let end = start + chunk * channels;
      self.soundtouch.put_samples(&pcm[start..end], chunk);
      self.position += chunk;

      self.collect_output();
    }

    self.collect_output();

    let available = self.reservoir.len() / channels;
    let to_copy = available.min(frames);
    if to_copy > 0 {
      let copy_samples = to_copy * channels;
      output[..copy_samples].copy_from_slice(&self.reservoir[..copy_samples]);
      self.reservoir.drain(..copy_samples);
    }
    output[to_copy * channels..samples_needed].fill(0.0);

    self.clock_frames = (self.clock_frames + to_copy as f64 * self.tempo).min(total_frames as f64);
    if self.is_finished() {
      self.clock_frames = total_frames as f64;
    }

    to_copy
  }

  fn collect_output(&mut self) {
    let channels = DEFAULT_CHANNELS as usize;
    let buf_frames = self.output_buffer.len() / channels;
    loop {
      let received = self
        .soundtouch
        .receive_samples(&mut self.output_buffer, buf_frames);
      if received == 0 {
        break;
      }
      self
        .reservoir
        .extend_from_slice(&self.output_buffer[..received * channels]);
    }
  }

  fn clear(&mut self) {
    self.soundtouch.clear();
    self.reservoir.clear();
  }
}
