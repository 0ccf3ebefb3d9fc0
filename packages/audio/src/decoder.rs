//! Decoded asset loader
//!
//! Turns a stored audio file into an in-memory stereo buffer at the engine
//! sample rate:
//! - existence is checked synchronously before any work is scheduled
//! - decoding (symphonia) runs on the asset worker, off the playback clock
//! - the result is resampled and up/down-mixed to interleaved stereo f32

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::DEFAULT_CHANNELS;
use crate::error::{EngineError, Result};
use crate::fs::FileSystem;

/// Interleaved stereo PCM shared between the control plane and the audio thread
#[derive(Clone, Debug)]
pub struct DecodedBuffer {
  samples: Arc<[f32]>,
  sample_rate: u32,
}

impl DecodedBuffer {
  pub fn from_interleaved(samples: Vec<f32>, sample_rate: u32) -> Self {
    Self {
      samples: samples.into(),
      sample_rate,
    }
  }

  pub fn samples(&self) -> &[f32] {
    &self.samples
  }

  pub fn sample_rate(&self) -> u32 {
    self.sample_rate
  }

  pub fn frames(&self) -> usize {
    self.samples.len() / DEFAULT_CHANNELS as usize
  }

  pub fn duration(&self) -> f64 {
    if self.sample_rate == 0 {
      return 0.0;
    }
    self.frames() as f64 / self.sample_rate as f64
  }

  pub fn is_empty(&self) -> bool {
    self.frames() == 0
  }

  /// Average of both channels, used for impulse responses
  pub fn to_mono(&self) -> Vec<f32> {
    self
      .samples
      .chunks_exact(DEFAULT_CHANNELS as usize)
      .map(|frame| (frame[0] + frame[1]) * 0.5)
      .collect()
  }
}

/// Decode a complete audio file held in memory
pub fn decode_audio(
  bytes: Vec<u8>,
  extension: Option<&str>,
  target_sample_rate: u32,
) -> Result<DecodedBuffer> {
  let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

  let mut hint = Hint::new();
  if let Some(ext) = extension {
    hint.with_extension(ext);
  }

  let probed = symphonia::default::get_probe()
    .format(
      &hint,
      mss,
      &FormatOptions::default(),
      &MetadataOptions::default(),
    )
    .map_err(|e| EngineError::DecodeError(format!("Failed to probe format: {}", e)))?;

  let mut format = probed.format;

  let track = format
    .tracks()
    .iter()
    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
    .ok_or_else(|| EngineError::DecodeError("No audio track found".to_string()))?;

  let track_id = track.id;
  let source_sample_rate = track.codec_params.sample_rate.unwrap_or(target_sample_rate);
  let mut source_channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

  let mut decoder = symphonia::default::get_codecs()
    .make(&track.codec_params, &DecoderOptions::default())
    .map_err(|e| EngineError::DecodeError(format!("Failed to create decoder: {}", e)))?;

  let mut all_samples: Vec<f32> = Vec::new();

  loop {
    let packet = match format.next_packet() {
      Ok(packet) => packet,
      Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
      Err(SymphoniaError::ResetRequired) => break,
      Err(e) => return Err(EngineError::DecodeError(format!("Format error: {}", e))),
    };

    if packet.track_id() != track_id {
      continue;
    }

    match decoder.decode(&packet) {
      Ok(audio_buf) => {
        let spec = *audio_buf.spec();
        source_channels = spec.channels.count();
        let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        all_samples.extend_from_slice(sample_buf.samples());
      }
      // Corrupt packets are skipped, the rest of the stream is still usable
      Err(SymphoniaError::DecodeError(_)) => continue,
      Err(e) => return Err(EngineError::DecodeError(format!("Decode error: {}", e))),
    }
  }

  if all_samples.is_empty() || source_channels == 0 {
    return Err(EngineError::DecodeError("No samples decoded".to_string()));
  }

  let pcm = to_stereo(
    &all_samples,
    source_channels,
    source_sample_rate,
    target_sample_rate,
  );

  Ok(DecodedBuffer::from_interleaved(pcm, target_sample_rate))
}

/// Linear-interpolating resample to interleaved stereo
fn to_stereo(
  samples: &[f32],
  source_channels: usize,
  source_sample_rate: u32,
  target_sample_rate: u32,
) -> Vec<f32> {
  let out_channels = DEFAULT_CHANNELS as usize;
  let source_frames = samples.len() / source_channels;
  if source_frames == 0 {
    return Vec::new();
  }

  let ratio = source_sample_rate as f64 / target_sample_rate as f64;
  let target_frames = if source_sample_rate == target_sample_rate {
    source_frames
  } else {
    (source_frames as f64 / ratio) as usize
  };

  let sample_at = |frame: usize, ch: usize| -> f32 {
    let src_ch = ch.min(source_channels - 1);
    samples[frame * source_channels + src_ch]
  };

  let mut pcm = vec![0f32; target_frames * out_channels];
  for frame in 0..target_frames {
    let src_pos = frame as f64 * ratio;
    let i0 = (src_pos as usize).min(source_frames - 1);
    let i1 = (i0 + 1).min(source_frames - 1);
    let frac = (src_pos - i0 as f64) as f32;

    for ch in 0..out_channels {
      let a = sample_at(i0, ch);
      let b = sample_at(i1, ch);
      pcm[frame * out_channels + ch] = (a + (b - a) * frac).clamp(-1.0, 1.0);
    }
  }

  pcm
}

/// Loads song and impulse assets through the host filesystem
#[derive(Clone)]
pub struct AssetLoader {
  fs: Arc<dyn FileSystem>,
  sample_rate: u32,
}

impl AssetLoader {
  pub fn new(fs: Arc<dyn FileSystem>, sample_rate: u32) -> Self {
    Self { fs, sample_rate }
  }

  /// Synchronous existence check, done before a decode is scheduled
  pub fn ensure_exists(&self, path: &str) -> Result<()> {
    if self.fs.file_exists(path) {
      Ok(())
    } else {
      Err(EngineError::FileNotFound(path.to_string()))
    }
  }

  /// Read and decode `path`; blocking, call from the asset worker
  pub fn load(&self, path: &str) -> Result<DecodedBuffer> {
    self.ensure_exists(path)?;
    let bytes = self
      .fs
      .read_binary(path)
      .map_err(|e| EngineError::DecodeError(e.to_string()))?;
    let extension = Path::new(path).extension().and_then(|e| e.to_str());
    decode_audio(bytes, extension, self.sample_rate)
  }
}
