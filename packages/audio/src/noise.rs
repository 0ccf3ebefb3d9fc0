//! Noise suppression for captured microphone input
//!
//! Applied when a channel is acquired with the noise-suppression capture
//! constraint. The chain is mono:
//! - HIGH-PASS: 2x Butterworth at 90 Hz (rumble, handling noise)
//! - LOW-PASS: Butterworth at 9 kHz (hiss)
//! - GATE: downward expander keyed on an adaptive noise floor

use std::f32::consts::PI;

const HIGHPASS_HZ: f32 = 90.0;
const LOWPASS_HZ: f32 = 9000.0;

/// Gate opens this far above the tracked noise floor
const GATE_RATIO: f32 = 3.0;
/// Gain applied to signal judged to be noise
const GATE_FLOOR_GAIN: f32 = 0.05;
const ENVELOPE_ATTACK_MS: f32 = 2.0;
const ENVELOPE_RELEASE_MS: f32 = 120.0;
const GAIN_SMOOTH_MS: f32 = 10.0;
/// Noise floor rises slowly and falls quickly
const FLOOR_RISE_MS: f32 = 4000.0;
const FLOOR_FALL_MS: f32 = 50.0;
const MIN_NOISE_FLOOR: f32 = 1e-4;
/// Sustained signal above this level is never treated as noise
const MAX_NOISE_FLOOR: f32 = 0.02;

/// Biquad filter coefficients (Direct Form I)
#[derive(Clone, Copy, Default)]
struct BiquadCoefficients {
  b0: f32,
  b1: f32,
  b2: f32,
  a1: f32,
  a2: f32,
}

impl BiquadCoefficients {
  fn butterworth(fc: f32, sample_rate: f32, highpass: bool) -> Self {
    let q = std::f32::consts::FRAC_1_SQRT_2;
    let w0 = 2.0 * PI * (fc / sample_rate).min(0.49);
    let cos_w0 = w0.cos();
    let alpha = w0.sin() / (2.0 * q);
    let a0 = 1.0 + alpha;

    let (b0, b1) = if highpass {
      ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0))
    } else {
      ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0)
    };

    Self {
      b0: b0 / a0,
      b1: b1 / a0,
      b2: b0 / a0,
      a1: -2.0 * cos_w0 / a0,
      a2: (1.0 - alpha) / a0,
    }
  }
}

#[derive(Clone, Copy, Default)]
struct Biquad {
  coeffs: BiquadCoefficients,
  x1: f32,
  x2: f32,
  y1: f32,
  y2: f32,
}

impl Biquad {
  fn new(coeffs: BiquadCoefficients) -> Self {
    Self {
      coeffs,
      ..Default::default()
    }
  }

  #[inline]
  fn process(&mut self, input: f32) -> f32 {
    let c = &self.coeffs;
    let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
    self.x2 = self.x1;
    self.x1 = input;
    self.y2 = self.y1;
    self.y1 = output;
    output
  }
}

/// One-pole smoothing coefficient for a time constant in milliseconds
fn smoothing(ms: f32, sample_rate: f32) -> f32 {
  (-1.0 / (ms * 0.001 * sample_rate)).exp()
}

pub struct NoiseSuppressor {
  highpass: [Biquad; 2],
  lowpass: Biquad,
  envelope: f32,
  noise_floor: f32,
  gain: f32,
  attack: f32,
  release: f32,
  gain_smooth: f32,
  floor_rise: f32,
  floor_fall: f32,
}

impl NoiseSuppressor {
  pub fn new(sample_rate: u32) -> Self {
    let sr = sample_rate.max(1) as f32;
    let hp = BiquadCoefficients::butterworth(HIGHPASS_HZ, sr, true);
    Self {
      highpass: [Biquad::new(hp), Biquad::new(hp)],
      lowpass: Biquad::new(BiquadCoefficients::butterworth(LOWPASS_HZ, sr, false)),
      envelope: 0.0,
      noise_floor: MIN_NOISE_FLOOR,
      gain: 1.0,
      attack: smoothing(ENVELOPE_ATTACK_MS, sr),
      release: smoothing(ENVELOPE_RELEASE_MS, sr),
      gain_smooth: smoothing(GAIN_SMOOTH_MS, sr),
      floor_rise: smoothing(FLOOR_RISE_MS, sr),
      floor_fall: smoothing(FLOOR_FALL_MS, sr),
    }
  }

  /// Process a mono buffer in place
  pub fn process(&mut self, buffer: &mut [f32]) {
    for sample in buffer.iter_mut() {
      let mut x = *sample;
      for filter in self.highpass.iter_mut() {
        x = filter.process(x);
      }
      x = self.lowpass.process(x);

      let level = x.abs();
      let coeff = if level > self.envelope {
        self.attack
      } else {
        self.release
      };
      self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

      let floor_coeff = if self.envelope > self.noise_floor {
        self.floor_rise
      } else {
        self.floor_fall
      };
      self.noise_floor = (floor_coeff * self.noise_floor + (1.0 - floor_coeff) * self.envelope)
        .clamp(MIN_NOISE_FLOOR, MAX_NOISE_FLOOR);

      let target = if self.envelope > self.noise_floor * GATE_RATIO {
        1.0
      } else {
        GATE_FLOOR_GAIN
      };
      self.gain = self.gain_smooth * self.gain + (1.0 - self.gain_smooth) * target;

      *sample = x * self.gain;
    }
  }

  pub fn reset(&mut self) {
    for filter in self.highpass.iter_mut() {
      *filter = Biquad::new(filter.coeffs);
    }
    self.lowpass = Biquad::new(self.lowpass.coeffs);
    self.envelope = 0.0;
    self.noise_floor = MIN_NOISE_FLOOR;
    self.gain = 1.0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rms(buffer: &[f32]) -> f32 {
    (buffer.iter().map(|s| s * s).sum::<f32>() / buffer.len() as f32).sqrt()
  }

  fn sine(freq: f32, amplitude: f32, frames: usize) -> Vec<f32> {
    (0..frames)
      .map(|i| (2.0 * PI * freq * i as f32 / 44_100.0).sin() * amplitude)
      .collect()
  }

  #[test]
  fn test_rumble_is_removed() {
    let mut suppressor = NoiseSuppressor::new(44_100);
    let mut rumble = sine(20.0, 0.5, 44_100);
    suppressor.process(&mut rumble);
    assert!(rms(&rumble[22_050..]) < 0.05);
  }

  #[test]
  fn test_voice_band_passes() {
    let mut suppressor = NoiseSuppressor::new(44_100);
    let mut voice = sine(440.0, 0.5, 44_100 * 5);
    suppressor.process(&mut voice);
    let out = rms(&voice[44_100 * 4..]);
    assert!(out > 0.25, "voice attenuated to {}", out);
  }

  #[test]
  fn test_steady_low_level_noise_is_gated() {
    let mut suppressor = NoiseSuppressor::new(44_100);
    // Quiet constant-level hum in the voice band settles into the floor
    let mut hum = sine(1000.0, 0.01, 44_100 * 5);
    suppressor.process(&mut hum);
    assert!(rms(&hum[44_100 * 4..]) < 0.01 * 0.5);
  }

  #[test]
  fn test_reset_clears_state() {
    let mut suppressor = NoiseSuppressor::new(44_100);
    let mut loud = sine(440.0, 0.9, 4096);
    suppressor.process(&mut loud);
    suppressor.reset();
    let mut silence = vec![0.0f32; 16];
    suppressor.process(&mut silence);
    assert!(silence.iter().all(|s| *s == 0.0));
  }
}
